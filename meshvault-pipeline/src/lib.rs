//! MeshVault storage pipeline
//!
//! Turns files into erasure-coded, encrypted shards spread over a group of
//! members, and keeps them readable as members fail:
//! - [`StoragePipeline`]: upload, versioned update, racing and streaming download
//! - [`healer`]: stripe health scans, repair priorities and target selection
//! - [`manifest`]: append-only manifest history
//! - [`CheckpointManager`] and [`Publisher`] for private snapshots and public markdown

pub mod checkpoint;
pub mod config;
pub mod healer;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod publish;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointTask, SnapshotSource};
pub use config::{LoggingSettings, PipelineConfig};
pub use healer::{HealingStatus, RepairReport, ScanReport, StripeHealth, StripeIssue};
pub use logging::init_tracing;
pub use manifest::{Manifest, ManifestStore, Redundancy, RedundancyMode, ShardLocation, StripeInfo};
pub use pipeline::{PartitionHealReport, ReplicationStatus, StoragePipeline};
pub use publish::{Publication, Publisher};

pub use meshvault_core::{MeshVaultError, Result};
