//! Storage pipeline
//!
//! Files are cut into fixed-size stripes, each stripe is erasure coded and
//! every shard is sealed under the group key and placed round-robin on the
//! members reachable from the uploader. The manifest is committed once every
//! shard has landed. Downloads race all mapped holders of a stripe and decode
//! as soon as `k` valid shards have arrived.
//!
//! Member failures trigger a healing pass in the background: degraded
//! stripes are rebuilt from the surviving shards and the missing shards are
//! placed on the least-loaded reachable members.

use crate::checkpoint::CheckpointManager;
use crate::config::PipelineConfig;
use crate::healer::{self, HealingStatus, RepairPlanner, RepairReport, ScanReport, StripeIssue};
use crate::manifest::{
    next_patch_version, Manifest, ManifestStore, Redundancy, ShardLocation, StripeInfo,
    INITIAL_VERSION,
};
use crate::publish::Publisher;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::stream::{self, BoxStream, FuturesUnordered, StreamExt, TryStreamExt};
use meshvault_core::chunk::{effective_chunk_size, split_into_chunks};
use meshvault_core::crypto::ContentHash;
use meshvault_core::erasure::{ErasureCodec, Shard};
use meshvault_core::identity::Identity;
use meshvault_core::{MeshVaultError, Result};
use meshvault_keys::{GroupKeyManager, GroupMember, KeyContext, MasterKey, PolicyEngine, StoragePolicy};
use meshvault_storage::{BlockMetadata, ContentStore, HealReport, PeerNetwork, StoreConfig};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// MIME type recorded on shard blocks
pub const SHARD_MIME_TYPE: &str = "application/vnd.meshvault.shard";

/// MIME type recorded for model weights and training checkpoints
pub const MODEL_MIME_TYPE: &str = "application/vnd.meshvault.model";

const MODEL_EXTENSIONS: [&str; 3] = ["safetensors", "ckpt", "pt"];

/// Reachable shards of one file, as seen from the first online member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationStatus {
    pub file_id: String,
    pub version: String,
    pub revision: u32,
    pub target_replication: usize,
    /// Shards needed to decode a stripe
    pub required: usize,
    /// Reachable shards per stripe, in stripe order
    pub stripes: Vec<usize>,
    pub current_replication: usize,
}

impl ReplicationStatus {
    pub fn is_fully_replicated(&self) -> bool {
        self.current_replication >= self.target_replication
    }

    pub fn is_recoverable(&self) -> bool {
        self.current_replication >= self.required
    }
}

/// Outcome of [`StoragePipeline::heal_partition`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionHealReport {
    pub store: HealReport,
    pub repair: RepairReport,
}

struct Member {
    member_id: String,
    store: Arc<ContentStore>,
}

struct Inner {
    config: PipelineConfig,
    network: Arc<PeerNetwork>,
    groups: Arc<GroupKeyManager>,
    members: Vec<Member>,
    manifests: ManifestStore,
    status: watch::Sender<HealingStatus>,
    /// Healing passes requested but not yet finished
    queued_heals: AtomicUsize,
    heal_lock: Mutex<()>,
    publishers: RwLock<HashMap<String, Arc<Publisher>>>,
    /// Keyed by (member, namespace)
    checkpoints: RwLock<HashMap<(String, String), Arc<CheckpointManager>>>,
}

/// File storage across a group of members
#[derive(Clone)]
pub struct StoragePipeline {
    inner: Arc<Inner>,
}

impl StoragePipeline {
    /// Build a group of `members` nodes on a fresh in-process network
    ///
    /// Members are named `member_0..member_{n-1}`. Each gets its own identity
    /// and master key; all share one group key for shard encryption.
    pub fn simulated(config: PipelineConfig, members: usize) -> Result<Self> {
        config.validate()?;
        if members == 0 {
            return Err(MeshVaultError::Configuration(
                "a pipeline needs at least one member".to_string(),
            ));
        }

        let network = PeerNetwork::new();
        let groups = Arc::new(GroupKeyManager::new());
        let store_config = StoreConfig {
            replication_factor: config.block_replication,
            default_policy: StoragePolicy::group_scoped(config.group_id.clone()),
            fetch_timeout_ms: config.shard_fetch_timeout_ms,
            ..StoreConfig::default()
        };

        let mut joined = Vec::with_capacity(members);
        let mut group_members = Vec::with_capacity(members);
        for i in 0..members {
            let member_id = format!("member_{i}");
            let identity = Arc::new(Identity::generate());
            let engine = Arc::new(PolicyEngine::with_groups(
                MasterKey::generate(),
                groups.clone(),
            )?);
            group_members.push(GroupMember::from_identity(member_id.clone(), &identity));
            let store = ContentStore::join(
                network.clone(),
                identity,
                engine,
                store_config.clone(),
            )?;
            joined.push(Member {
                member_id,
                store: Arc::new(store),
            });
        }
        groups.create_group(&config.group_id, &group_members)?;

        let erasure = config.erasure_config_for(members)?;
        info!(
            members,
            data_shards = erasure.data_shards,
            parity_shards = erasure.parity_shards,
            group_id = %config.group_id,
            "Storage pipeline ready"
        );

        let (status, _) = watch::channel(HealingStatus {
            target_replication: erasure.total_shards(),
            current_replication: erasure.total_shards(),
            ..HealingStatus::default()
        });

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                network,
                groups,
                members: joined,
                manifests: ManifestStore::new(),
                status,
                queued_heals: AtomicUsize::new(0),
                heal_lock: Mutex::new(()),
                publishers: RwLock::new(HashMap::new()),
                checkpoints: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn network(&self) -> &Arc<PeerNetwork> {
        &self.inner.network
    }

    pub fn groups(&self) -> &Arc<GroupKeyManager> {
        &self.inner.groups
    }

    /// Member ids in join order
    pub fn members(&self) -> Vec<String> {
        self.inner
            .members
            .iter()
            .map(|m| m.member_id.clone())
            .collect()
    }

    /// Members that are currently online
    pub fn online_members(&self) -> Vec<String> {
        self.inner
            .members
            .iter()
            .filter(|m| self.inner.network.is_online(&m.store.node_id()))
            .map(|m| m.member_id.clone())
            .collect()
    }

    pub fn store(&self, member_id: &str) -> Result<Arc<ContentStore>> {
        Ok(self.member(member_id)?.store.clone())
    }

    fn member(&self, member_id: &str) -> Result<&Member> {
        self.inner
            .members
            .iter()
            .find(|m| m.member_id == member_id)
            .ok_or_else(|| MeshVaultError::NotFound(format!("member {member_id}")))
    }

    fn member_index(&self, member_id: &str) -> Result<usize> {
        self.inner
            .members
            .iter()
            .position(|m| m.member_id == member_id)
            .ok_or_else(|| MeshVaultError::NotFound(format!("member {member_id}")))
    }

    /// First online member; the vantage point for scans and default reads
    fn observer(&self) -> Result<&Member> {
        self.inner
            .members
            .iter()
            .find(|m| self.inner.network.is_online(&m.store.node_id()))
            .ok_or_else(|| MeshVaultError::NodeUnavailable("every member is offline".to_string()))
    }

    fn ensure_online(&self, member: &Member) -> Result<()> {
        if self.inner.network.is_online(&member.store.node_id()) {
            Ok(())
        } else {
            Err(MeshVaultError::NodeUnavailable(format!(
                "{} is offline",
                member.member_id
            )))
        }
    }

    // ===== Manifests =====

    pub fn manifest(&self, file_id: &str) -> Result<Manifest> {
        self.inner.manifests.latest(file_id)
    }

    pub fn manifest_history(&self, file_id: &str) -> Vec<Manifest> {
        self.inner.manifests.history(file_id)
    }

    pub fn find_by_name(&self, file_name: &str) -> Option<Manifest> {
        self.inner.manifests.find_by_name(file_name)
    }

    /// Latest manifest of every stored file
    pub fn list_files(&self) -> Vec<Manifest> {
        self.inner.manifests.all_latest()
    }

    // ===== Uploads =====

    /// Store a new file and return its first manifest
    pub async fn upload_file(&self, file_name: &str, data: Bytes, uploader: &str) -> Result<Manifest> {
        self.write_version(
            Uuid::new_v4().to_string(),
            file_name,
            data,
            uploader,
            INITIAL_VERSION.to_string(),
            None,
        )
        .await
    }

    /// Store new content for an existing file under the next patch version
    pub async fn update_file(&self, file_id: &str, data: Bytes, uploader: &str) -> Result<Manifest> {
        let current = self.inner.manifests.latest(file_id)?;
        let version = next_patch_version(&current.version)?;
        self.write_version(
            file_id.to_string(),
            &current.file_name,
            data,
            uploader,
            version,
            Some(current.version),
        )
        .await
    }

    #[instrument(skip(self, data, previous_version), fields(size = data.len()))]
    async fn write_version(
        &self,
        file_id: String,
        file_name: &str,
        data: Bytes,
        uploader: &str,
        version: String,
        previous_version: Option<String>,
    ) -> Result<Manifest> {
        if file_name.is_empty() {
            return Err(MeshVaultError::Storage("file name cannot be empty".to_string()));
        }
        let source = self.member(uploader)?;
        self.ensure_online(source)?;

        let from = source.store.node_id();
        let targets: Vec<&Member> = self
            .inner
            .members
            .iter()
            .filter(|m| self.inner.network.reachable(&from, &m.store.node_id()))
            .collect();
        if targets.is_empty() {
            return Err(MeshVaultError::NodeUnavailable(format!(
                "no members reachable from {uploader}"
            )));
        }

        let erasure = self.inner.config.erasure_config_for(self.inner.members.len())?;
        let codec = ErasureCodec::with_config(erasure)?;
        let policy = StoragePolicy::group_scoped(self.inner.config.group_id.clone());
        let chunk_size = effective_chunk_size(self.inner.config.chunk_size);
        let checksum = ContentHash::compute(&data);

        let mut stripes = Vec::new();
        let mut placements = Vec::new();
        for chunk in split_into_chunks(&data, chunk_size) {
            let shards = codec.encode(&chunk.data)?;
            let stripe_checksum = shards
                .first()
                .map(|s| s.stripe_checksum)
                .unwrap_or_else(|| ContentHash::compute(&chunk.data));
            stripes.push(StripeInfo {
                chunk_index: chunk.index,
                size: chunk.data.len() as u64,
                checksum: stripe_checksum,
            });
            for shard in shards {
                let target = targets[shard.shard_index % targets.len()];
                placements.push((chunk.index, shard, target));
            }
        }

        let mut shard_locations: Vec<ShardLocation> = stream::iter(placements)
            .map(|(chunk_index, shard, target)| {
                self.place_shard(source, target, chunk_index, shard, &policy)
            })
            .buffer_unordered(self.inner.config.max_concurrent_transfers)
            .try_collect()
            .await?;
        shard_locations.sort_by_key(|loc| (loc.chunk_index, loc.shard_index));

        let manifest = Manifest {
            file_id,
            file_name: file_name.to_string(),
            shard_locations,
            checksum,
            size: data.len() as u64,
            mime_type: guess_mime_type(file_name),
            created_at: Utc::now(),
            version,
            previous_version,
            revision: 0,
            policy,
            redundancy: Redundancy::from_config(&erasure),
            chunk_size,
            stripes,
            uploader: uploader.to_string(),
        };
        self.inner.manifests.commit(manifest.clone())?;

        info!(
            file_id = %manifest.file_id,
            version = %manifest.version,
            stripes = manifest.stripes.len(),
            shards = manifest.shard_locations.len(),
            members = targets.len(),
            "File stored"
        );
        Ok(manifest)
    }

    /// Seal one shard from `from` and place it on `to`
    async fn place_shard(
        &self,
        from: &Member,
        to: &Member,
        chunk_index: u32,
        shard: Shard,
        policy: &StoragePolicy,
    ) -> Result<ShardLocation> {
        let bytes = shard.to_bytes()?;
        let metadata = BlockMetadata::new(bytes.len() as u64)
            .with_mime_type(SHARD_MIME_TYPE)
            .with_erasure_index(shard.shard_index as u32)
            .with_forward_identity(from.member_id.clone());
        let node_id = to.store.node_id();

        let (block_id, existed) = from
            .store
            .put_on(&node_id, &bytes, policy, KeyContext::File, Some(metadata))
            .await?;
        if existed {
            debug!(shard_id = %shard.id, member = %to.member_id, "Shard already held");
        }

        Ok(ShardLocation {
            shard_id: shard.id,
            shard_index: shard.shard_index,
            chunk_index,
            node_id,
            block_id,
            member_id: to.member_id.clone(),
        })
    }

    // ===== Downloads =====

    /// Read a file as seen from the first online member
    pub async fn download_file(&self, file_id: &str) -> Result<Bytes> {
        let requester = self.observer()?;
        self.download_with(file_id, requester).await
    }

    /// Read a file on behalf of a specific member
    pub async fn download_file_from(&self, file_id: &str, requester: &str) -> Result<Bytes> {
        let requester = self.member(requester)?;
        self.download_with(file_id, requester).await
    }

    #[instrument(skip(self, requester), fields(requester = %requester.member_id))]
    async fn download_with(&self, file_id: &str, requester: &Member) -> Result<Bytes> {
        self.ensure_online(requester)?;
        let manifest = self.inner.manifests.latest(file_id)?;
        let codec = ErasureCodec::with_config(manifest.redundancy.erasure_config()?)?;

        let stripes: Vec<Bytes> = stream::iter(&manifest.stripes)
            .map(|stripe| self.fetch_stripe(requester, &manifest, stripe, &codec))
            .buffered(self.inner.config.max_concurrent_transfers)
            .try_collect()
            .await?;

        let mut file = BytesMut::with_capacity(manifest.size as usize);
        for stripe in &stripes {
            file.extend_from_slice(stripe);
        }
        let file = file.freeze();
        verify_file(&manifest, file.len() as u64, &ContentHash::compute(&file))?;

        debug!(file_id, size = file.len(), "File downloaded");
        Ok(file)
    }

    /// Stream a file in pieces of at most `stream_chunk_size` bytes
    ///
    /// Stripes are fetched and decoded one at a time. The last item is an
    /// error if the reassembled bytes do not match the manifest.
    pub fn download_stream(
        &self,
        file_id: &str,
        requester: &str,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let member = self.member_index(requester)?;
        self.ensure_online(&self.inner.members[member])?;
        let manifest = self.inner.manifests.latest(file_id)?;
        let codec = ErasureCodec::with_config(manifest.redundancy.erasure_config()?)?;

        let state = StreamState {
            pipeline: self.clone(),
            member,
            manifest,
            codec,
            next_stripe: 0,
            pending: VecDeque::new(),
            hasher: blake3::Hasher::new(),
            emitted: 0,
            finished: false,
        };
        Ok(stream::unfold(state, |mut state| async move {
            loop {
                if let Some(piece) = state.pending.pop_front() {
                    return Some((Ok(piece), state));
                }
                if state.finished {
                    return None;
                }

                if state.next_stripe == state.manifest.stripes.len() {
                    state.finished = true;
                    let checksum = ContentHash::from_bytes(*state.hasher.finalize().as_bytes());
                    return match verify_file(&state.manifest, state.emitted, &checksum) {
                        Ok(()) => None,
                        Err(e) => Some((Err(e), state)),
                    };
                }

                let fetched = {
                    let member = &state.pipeline.inner.members[state.member];
                    let stripe = &state.manifest.stripes[state.next_stripe];
                    state
                        .pipeline
                        .fetch_stripe(member, &state.manifest, stripe, &state.codec)
                        .await
                };
                match fetched {
                    Ok(data) => {
                        state.next_stripe += 1;
                        state.hasher.update(&data);
                        state.emitted += data.len() as u64;
                        let piece = state.pipeline.inner.config.stream_chunk_size;
                        let mut offset = 0;
                        while offset < data.len() {
                            let end = (offset + piece).min(data.len());
                            state.pending.push_back(data.slice(offset..end));
                            offset = end;
                        }
                    }
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
        .boxed())
    }

    /// Decode one stripe from the first `k` valid shards to arrive
    async fn fetch_stripe(
        &self,
        requester: &Member,
        manifest: &Manifest,
        stripe: &StripeInfo,
        codec: &ErasureCodec,
    ) -> Result<Bytes> {
        let required = manifest.redundancy.data_shards;
        let shards = self
            .collect_shards(requester, manifest.locations_for(stripe.chunk_index), stripe, required)
            .await;
        if shards.len() < required {
            warn!(
                file_id = %manifest.file_id,
                chunk_index = stripe.chunk_index,
                available = shards.len(),
                required,
                "Stripe not recoverable"
            );
            return Err(MeshVaultError::InsufficientShards {
                available: shards.len(),
                required,
            });
        }

        let data = codec.decode(&shards)?;
        if data.len() as u64 != stripe.size {
            return Err(MeshVaultError::VersionMismatch(format!(
                "stripe {} decoded to {} bytes, expected {}",
                stripe.chunk_index,
                data.len(),
                stripe.size
            )));
        }
        Ok(data)
    }

    /// Race every location and keep up to `needed` verified shards
    async fn collect_shards(
        &self,
        requester: &Member,
        locations: Vec<&ShardLocation>,
        stripe: &StripeInfo,
        needed: usize,
    ) -> Vec<Shard> {
        let wait = self.inner.config.shard_fetch_timeout();
        let store = &requester.store;
        let mut pending: FuturesUnordered<_> = locations
            .into_iter()
            .map(|loc| async move {
                let fetched =
                    tokio::time::timeout(wait, store.get_from(&loc.node_id, &loc.block_id, None)).await;
                (loc, fetched)
            })
            .collect();

        let mut shards = Vec::with_capacity(needed);
        while let Some((loc, fetched)) = pending.next().await {
            match fetched {
                Ok(Ok(plaintext)) => match Shard::from_bytes(&plaintext) {
                    Ok(shard)
                        if shard.shard_index == loc.shard_index
                            && shard.stripe_checksum == stripe.checksum
                            && shard.verify() =>
                    {
                        shards.push(shard);
                        if shards.len() >= needed {
                            break;
                        }
                    }
                    Ok(_) => {
                        warn!(shard_id = %loc.shard_id, member = %loc.member_id, "Shard failed verification, skipping");
                    }
                    Err(e) => {
                        warn!(shard_id = %loc.shard_id, member = %loc.member_id, error = %e, "Unreadable shard, skipping");
                    }
                },
                Ok(Err(e)) => {
                    debug!(shard_id = %loc.shard_id, member = %loc.member_id, error = %e, "Shard unavailable");
                }
                Err(_) => {
                    debug!(shard_id = %loc.shard_id, member = %loc.member_id, ?wait, "Shard fetch timed out");
                }
            }
        }
        shards
    }

    // ===== Failures and healing =====

    /// Take a member offline; starts a healing pass when `auto_heal` is set
    pub fn simulate_member_failure(&self, member_id: &str) -> Result<()> {
        let member = self.member(member_id)?;
        member.store.simulate_node_failure(&member.store.node_id())?;
        warn!(member = member_id, "Member failed");

        if self.inner.config.auto_heal {
            self.schedule_heal();
        }
        Ok(())
    }

    /// Bring a failed member back online
    pub fn restore_member(&self, member_id: &str) -> Result<()> {
        let member = self.member(member_id)?;
        member.store.restore_node(&member.store.node_id())
    }

    fn begin_heal(&self) {
        self.inner.status.send_modify(|status| {
            self.inner.queued_heals.fetch_add(1, Ordering::SeqCst);
            status.in_progress = true;
        });
    }

    fn schedule_heal(&self) {
        self.begin_heal();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pipeline = self.clone();
                handle.spawn(async move {
                    if let Err(e) = pipeline.run_heal().await {
                        warn!(error = %e, "Background healing failed");
                    }
                });
            }
            Err(_) => {
                warn!("No async runtime, skipping background healing");
                self.finish_heal(|_| {});
            }
        }
    }

    /// Run a healing pass now and wait for it
    pub async fn heal_now(&self) -> Result<RepairReport> {
        self.begin_heal();
        self.run_heal().await
    }

    async fn run_heal(&self) -> Result<RepairReport> {
        let _guard = self.inner.heal_lock.lock().await;
        let result = self.heal_pass().await;
        let after = self.scan().ok();
        let default_target = self
            .inner
            .config
            .erasure_config_for(self.inner.members.len())
            .map(|c| c.total_shards())
            .unwrap_or_default();

        self.finish_heal(|status| {
            status.last_run = Some(Utc::now());
            if let Some(after) = &after {
                let target = if after.target_replication == 0 {
                    default_target
                } else {
                    after.target_replication
                };
                status.target_replication = target;
                status.current_replication = after.min_available.unwrap_or(target);
                status.files_scanned = after.files_scanned;
            }
            match &result {
                Ok(report) => {
                    status.shards_rebuilt = report.shards_rebuilt;
                    status.last_error = None;
                }
                Err(e) => status.last_error = Some(e.to_string()),
            }
        });
        result
    }

    /// Retire one queued pass and publish `update` with it
    ///
    /// The queue only changes under the status lock, so `in_progress` is
    /// set exactly while passes remain queued.
    fn finish_heal(&self, update: impl FnOnce(&mut HealingStatus)) {
        self.inner.status.send_modify(|status| {
            self.inner.queued_heals.fetch_sub(1, Ordering::SeqCst);
            update(status);
            status.in_progress = self.inner.queued_heals.load(Ordering::SeqCst) > 0;
        });
    }

    fn scan(&self) -> Result<ScanReport> {
        let observer = self.observer()?;
        let from = observer.store.node_id();
        let network = &self.inner.network;
        Ok(healer::scan(&self.inner.manifests.all_latest(), |loc| {
            network.reachable(&from, &loc.node_id)
        }))
    }

    #[instrument(skip(self))]
    async fn heal_pass(&self) -> Result<RepairReport> {
        let healer = self.observer()?;
        let from = healer.store.node_id();
        let network = &self.inner.network;
        let available = |loc: &ShardLocation| network.reachable(&from, &loc.node_id);

        let manifests = self.inner.manifests.all_latest();
        let scan = healer::scan(&manifests, available);
        info!(summary = %scan.summary(), "Healing scan complete");
        if scan.has_critical_issues() {
            warn!("Unrecoverable stripes detected");
        }

        let mut report = RepairReport {
            files_scanned: scan.files_scanned,
            stripes_degraded: scan.degraded(),
            unrecoverable: scan.issues.len() - scan.degraded(),
            ..RepairReport::default()
        };

        let candidates: Vec<String> = self
            .inner
            .members
            .iter()
            .filter(|m| network.reachable(&from, &m.store.node_id()))
            .map(|m| m.member_id.clone())
            .collect();
        let mut planner = RepairPlanner::from_manifests(candidates, &manifests, available);
        let mut working: HashMap<String, Manifest> = HashMap::new();

        for issue in scan.all_issues().into_iter().filter(|i| i.is_repairable()) {
            let Some(base) = manifests.iter().find(|m| m.file_id == issue.file_id) else {
                continue;
            };
            let manifest = working
                .entry(issue.file_id.clone())
                .or_insert_with(|| base.clone());

            match self.repair_stripe(healer, manifest, issue, &mut planner).await {
                Ok(rebuilt) => {
                    report.stripes_repaired += 1;
                    report.shards_rebuilt += rebuilt;
                }
                Err(e) => {
                    warn!(file_id = %issue.file_id, chunk_index = issue.chunk_index, error = %e, "Stripe repair failed");
                    report
                        .errors
                        .push(format!("{}#{}: {e}", issue.file_id, issue.chunk_index));
                }
            }
        }

        for (file_id, mut manifest) in working {
            let Some(base) = manifests.iter().find(|m| m.file_id == file_id) else {
                continue;
            };
            if manifest.shard_locations == base.shard_locations {
                continue;
            }
            manifest.revision = base.revision + 1;
            if self
                .inner
                .manifests
                .commit_if_latest(&base.version, base.revision, manifest)
            {
                report.manifests_committed += 1;
            } else {
                report
                    .errors
                    .push(format!("{file_id}: manifest changed during healing"));
            }
        }

        info!(
            stripes_repaired = report.stripes_repaired,
            shards_rebuilt = report.shards_rebuilt,
            unrecoverable = report.unrecoverable,
            "Healing pass finished"
        );
        Ok(report)
    }

    /// Rebuild the missing shards of one stripe and record their new homes
    async fn repair_stripe(
        &self,
        healer: &Member,
        manifest: &mut Manifest,
        issue: &StripeIssue,
        planner: &mut RepairPlanner,
    ) -> Result<usize> {
        let stripe = manifest
            .stripes
            .iter()
            .find(|s| s.chunk_index == issue.chunk_index)
            .cloned()
            .ok_or_else(|| MeshVaultError::NotFound(format!("stripe {}", issue.chunk_index)))?;
        let required = manifest.redundancy.data_shards;
        let codec = ErasureCodec::with_config(manifest.redundancy.erasure_config()?)?;

        let sources: Vec<ShardLocation> = manifest
            .locations_for(issue.chunk_index)
            .into_iter()
            .filter(|loc| issue.available.contains(&loc.shard_index))
            .cloned()
            .collect();
        let shards = self
            .collect_shards(healer, sources.iter().collect(), &stripe, required)
            .await;
        if shards.len() < required {
            return Err(MeshVaultError::InsufficientShards {
                available: shards.len(),
                required,
            });
        }

        let rebuilt = codec.reconstruct_shards(&shards, &issue.missing)?;
        let mut holders: HashSet<String> = sources.iter().map(|loc| loc.member_id.clone()).collect();
        let policy = manifest.policy.clone();

        let mut placed = 0;
        for shard in rebuilt {
            let target_id = planner.select_target(&holders).ok_or_else(|| {
                MeshVaultError::NodeUnavailable("no reachable member for rebuilt shard".to_string())
            })?;
            let target = self.member(&target_id)?;
            let location = self
                .place_shard(healer, target, issue.chunk_index, shard, &policy)
                .await?;
            holders.insert(target_id);

            match manifest.shard_locations.iter_mut().find(|loc| {
                loc.chunk_index == location.chunk_index && loc.shard_index == location.shard_index
            }) {
                Some(slot) => *slot = location,
                None => manifest.shard_locations.push(location),
            }
            placed += 1;
        }

        debug!(
            file_id = %manifest.file_id,
            chunk_index = issue.chunk_index,
            placed,
            "Stripe repaired"
        );
        Ok(placed)
    }

    pub fn healing_status(&self) -> HealingStatus {
        self.inner.status.borrow().clone()
    }

    /// Every change to the healing status
    pub fn healing_updates(&self) -> WatchStream<HealingStatus> {
        WatchStream::new(self.inner.status.subscribe())
    }

    /// Wait until no healing pass is running
    ///
    /// Defaults to the configured `heal_timeout_ms`.
    pub async fn wait_for_healing(&self, timeout: Option<Duration>) -> Result<HealingStatus> {
        let limit = timeout.unwrap_or_else(|| self.inner.config.heal_timeout());
        let mut updates = self.inner.status.subscribe();
        let settled = tokio::time::timeout(limit, async {
            updates
                .wait_for(|status| !status.in_progress)
                .await
                .map(|status| status.clone())
        })
        .await;
        match settled {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(MeshVaultError::Internal(
                "healing status channel closed".to_string(),
            )),
            Err(_) => Err(MeshVaultError::Internal(format!(
                "healing still running after {limit:?}"
            ))),
        }
    }

    /// Reachable shards per stripe of the latest version of a file
    pub fn replication_status(&self, file_id: &str) -> Result<ReplicationStatus> {
        let manifest = self.inner.manifests.latest(file_id)?;
        let observer = self.observer()?;
        let from = observer.store.node_id();

        let stripes: Vec<usize> = manifest
            .stripes
            .iter()
            .map(|stripe| {
                manifest
                    .locations_for(stripe.chunk_index)
                    .iter()
                    .filter(|loc| self.inner.network.reachable(&from, &loc.node_id))
                    .map(|loc| loc.shard_index)
                    .collect::<HashSet<usize>>()
                    .len()
            })
            .collect();
        let target = manifest.redundancy.total_shards();

        Ok(ReplicationStatus {
            current_replication: stripes.iter().copied().min().unwrap_or(target),
            file_id: manifest.file_id,
            version: manifest.version,
            revision: manifest.revision,
            target_replication: target,
            required: manifest.redundancy.data_shards,
            stripes,
        })
    }

    // ===== Partitions =====

    /// Split members into groups that can only reach each other
    pub fn simulate_partition(&self, groups: &[Vec<&str>]) -> Result<()> {
        let groups = groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|id| self.member(id).map(|m| m.store.node_id()))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        info!(groups = groups.len(), "Partitioning members");
        self.inner.members[0].store.simulate_network_partition(groups)
    }

    /// Re-admit every member and run a healing pass
    pub async fn heal_partition(&self) -> Result<PartitionHealReport> {
        let store = self.inner.members[0].store.heal().await?;
        let repair = self.heal_now().await?;
        info!(
            nodes_restored = store.nodes_restored,
            partitions_dissolved = store.partitions_dissolved,
            shards_rebuilt = repair.shards_rebuilt,
            "Partition healed"
        );
        Ok(PartitionHealReport { store, repair })
    }

    // ===== Member services =====

    /// Versioned markdown publishing through one member
    ///
    /// Every call for the same member returns the same publisher, so the
    /// release history carries over.
    pub fn publisher(&self, member_id: &str) -> Result<Arc<Publisher>> {
        let member = self.member(member_id)?;
        let mut publishers = self.inner.publishers.write();
        let publisher = publishers
            .entry(member.member_id.clone())
            .or_insert_with(|| Arc::new(Publisher::new(member.store.clone())));
        Ok(publisher.clone())
    }

    /// Checkpoints kept by one member under its private `namespace`
    ///
    /// One manager exists per member and namespace.
    pub fn checkpoint_manager(
        &self,
        member_id: &str,
        namespace: &str,
    ) -> Result<Arc<CheckpointManager>> {
        let member = self.member(member_id)?;
        let key = (member.member_id.clone(), namespace.to_string());
        if let Some(manager) = self.inner.checkpoints.read().get(&key) {
            return Ok(manager.clone());
        }

        let manager = Arc::new(CheckpointManager::new(member.store.clone(), namespace)?);
        let mut checkpoints = self.inner.checkpoints.write();
        Ok(checkpoints.entry(key).or_insert(manager).clone())
    }
}

struct StreamState {
    pipeline: StoragePipeline,
    member: usize,
    manifest: Manifest,
    codec: ErasureCodec,
    next_stripe: usize,
    pending: VecDeque<Bytes>,
    hasher: blake3::Hasher,
    emitted: u64,
    finished: bool,
}

fn verify_file(manifest: &Manifest, size: u64, checksum: &ContentHash) -> Result<()> {
    if size != manifest.size {
        return Err(MeshVaultError::VersionMismatch(format!(
            "file {} reassembled to {size} bytes, expected {}",
            manifest.file_id, manifest.size
        )));
    }
    if *checksum != manifest.checksum {
        return Err(MeshVaultError::VersionMismatch(format!(
            "file {} checksum mismatch",
            manifest.file_id
        )));
    }
    Ok(())
}

/// MIME type from the file extension
///
/// Model weights get [`MODEL_MIME_TYPE`]; everything else goes through
/// `mime_guess`.
pub fn guess_mime_type(file_name: &str) -> String {
    let path = Path::new(file_name);
    let is_model = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| MODEL_EXTENSIONS.iter().any(|m| ext.eq_ignore_ascii_case(m)));
    if is_model {
        return MODEL_MIME_TYPE.to_string();
    }
    mime_guess::from_path(path).first_or_octet_stream().to_string()
}
