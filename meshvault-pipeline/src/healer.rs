//! Stripe health scanning and repair planning
//!
//! The scan looks at every stripe of the latest manifests and counts how many
//! of its shards sit on reachable members. Stripes below full width are
//! issues; those with at least `k` shards left can be rebuilt. Rebuilt shards
//! go to the least-loaded reachable members that do not already hold a shard
//! of the same stripe.

use crate::manifest::{Manifest, ShardLocation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Healing progress published on the pipeline's watch channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingStatus {
    pub in_progress: bool,
    /// Full shard count per stripe
    pub target_replication: usize,
    /// Fewest reachable shards of any stripe after the last pass
    pub current_replication: usize,
    pub files_scanned: usize,
    pub shards_rebuilt: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

/// Stripe health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum StripeHealth {
    Healthy,
    /// Some shards lost, still decodable
    Degraded { available: usize, target: usize },
    /// Fewer than `required` shards reachable
    Unrecoverable { available: usize, required: usize },
}

/// A stripe that needs attention
#[derive(Debug, Clone)]
pub struct StripeIssue {
    pub file_id: String,
    pub version: String,
    pub revision: u32,
    pub chunk_index: u32,
    pub health: StripeHealth,
    /// Shard indices on reachable members
    pub available: Vec<usize>,
    /// Shard indices to rebuild
    pub missing: Vec<usize>,
    /// Higher is more urgent
    pub priority: u32,
    pub detected_at: DateTime<Utc>,
}

impl StripeIssue {
    /// Priority from health: one more loss away from data loss ranks first
    pub fn calculate_priority(health: &StripeHealth, required: usize) -> u32 {
        match health {
            StripeHealth::Unrecoverable { .. } => 1000,
            StripeHealth::Degraded { available, target } => {
                if *available <= required {
                    900
                } else {
                    (500 + (target - available) as u32 * 50).min(850)
                }
            }
            StripeHealth::Healthy => 0,
        }
    }

    pub fn is_repairable(&self) -> bool {
        matches!(self.health, StripeHealth::Degraded { .. })
    }
}

/// Result of scanning a set of manifests
#[derive(Debug, Default)]
pub struct ScanReport {
    pub files_scanned: usize,
    pub stripes_scanned: usize,
    pub issues: Vec<StripeIssue>,
    /// Widest stripe seen
    pub target_replication: usize,
    /// Fewest reachable shards of any stripe; `None` without stripes
    pub min_available: Option<usize>,
    pub duration: Duration,
}

impl ScanReport {
    /// Issues sorted by priority, most urgent first
    pub fn all_issues(&self) -> Vec<&StripeIssue> {
        let mut issues: Vec<&StripeIssue> = self.issues.iter().collect();
        issues.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.file_id.cmp(&b.file_id))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        issues
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues
            .iter()
            .any(|i| matches!(i.health, StripeHealth::Unrecoverable { .. }))
    }

    pub fn degraded(&self) -> usize {
        self.issues.iter().filter(|i| i.is_repairable()).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "Scanned {} stripes of {} files in {:?}: {} degraded, {} unrecoverable",
            self.stripes_scanned,
            self.files_scanned,
            self.duration,
            self.degraded(),
            self.issues.len() - self.degraded()
        )
    }
}

/// Scan manifests given a predicate telling whether a shard is reachable
pub fn scan<F>(manifests: &[Manifest], is_available: F) -> ScanReport
where
    F: Fn(&ShardLocation) -> bool,
{
    let start = Instant::now();
    let mut report = ScanReport {
        files_scanned: manifests.len(),
        ..ScanReport::default()
    };

    for manifest in manifests {
        let target = manifest.redundancy.total_shards();
        let required = manifest.redundancy.data_shards;
        report.target_replication = report.target_replication.max(target);

        for stripe in &manifest.stripes {
            report.stripes_scanned += 1;
            let locations = manifest.locations_for(stripe.chunk_index);
            let available: Vec<usize> = locations
                .iter()
                .copied()
                .filter(|loc| is_available(*loc))
                .map(|loc| loc.shard_index)
                .collect();
            let present: HashSet<usize> = available.iter().copied().collect();
            let missing: Vec<usize> = (0..target).filter(|i| !present.contains(i)).collect();

            let count = present.len();
            report.min_available = Some(report.min_available.map_or(count, |m| m.min(count)));

            let health = if missing.is_empty() {
                StripeHealth::Healthy
            } else if count >= required {
                StripeHealth::Degraded {
                    available: count,
                    target,
                }
            } else {
                StripeHealth::Unrecoverable {
                    available: count,
                    required,
                }
            };
            if health == StripeHealth::Healthy {
                continue;
            }

            report.issues.push(StripeIssue {
                file_id: manifest.file_id.clone(),
                version: manifest.version.clone(),
                revision: manifest.revision,
                chunk_index: stripe.chunk_index,
                priority: StripeIssue::calculate_priority(&health, required),
                health,
                available,
                missing,
                detected_at: Utc::now(),
            });
        }
    }

    report.duration = start.elapsed();
    report
}

/// Outcome of one healing pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub files_scanned: usize,
    pub stripes_degraded: usize,
    pub stripes_repaired: usize,
    pub shards_rebuilt: usize,
    pub unrecoverable: usize,
    pub manifests_committed: usize,
    pub errors: Vec<String>,
}

/// Picks placement targets for rebuilt shards
#[derive(Debug, Default)]
pub struct RepairPlanner {
    /// Candidates in preference order
    candidates: Vec<String>,
    load: HashMap<String, usize>,
}

impl RepairPlanner {
    /// `candidates` are reachable members; `load` counts shards they hold
    pub fn new(candidates: Vec<String>, load: HashMap<String, usize>) -> Self {
        Self { candidates, load }
    }

    /// Current shard count of all reachable members
    pub fn from_manifests<F>(candidates: Vec<String>, manifests: &[Manifest], is_available: F) -> Self
    where
        F: Fn(&ShardLocation) -> bool,
    {
        let mut load: HashMap<String, usize> = HashMap::new();
        for loc in manifests.iter().flat_map(|m| m.shard_locations.iter()) {
            if is_available(loc) {
                *load.entry(loc.member_id.clone()).or_default() += 1;
            }
        }
        Self::new(candidates, load)
    }

    fn load_of(&self, member_id: &str) -> usize {
        self.load.get(member_id).copied().unwrap_or(0)
    }

    /// Least-loaded candidate outside `holders`, falling back to the
    /// least-loaded candidate overall when every one already holds a shard
    pub fn select_target(&mut self, holders: &HashSet<String>) -> Option<String> {
        let pick = |allow_holders: bool| {
            self.candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| allow_holders || !holders.contains(*c))
                .min_by_key(|(order, c)| (self.load_of(c), *order))
                .map(|(_, c)| c.clone())
        };
        let target = pick(false).or_else(|| pick(true))?;
        *self.load.entry(target.clone()).or_default() += 1;
        Some(target)
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }
}
