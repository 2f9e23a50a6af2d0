//! Batched, parallel page migration.
//!
//! The engine turns a candidate batch into destination assignments bounded
//! by the target tier's free space, groups the assigned prefix into runs of
//! one owning pid each, fans every run out across the worker pool and drains
//! the pool before touching the next run. Candidates past the tier's
//! capacity are dropped from the batch; per-run syscall failures are logged
//! and tallied, never retried.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use itertools::Itertools;
use log::{debug, warn};

use crate::{
    candidates::{Candidate, SwitchBatch},
    topology::{Tier, TierTopology},
};

mod mover;
mod pool;

pub use mover::{PageMover, SyscallMover};
pub use pool::{Job, WorkerPool};

pub struct MigrationEngine {
    topology: Arc<TierTopology>,
    pool: Arc<WorkerPool>,
    mover: Arc<dyn PageMover>,
    workers_max: usize,
}

/// `(start, len)` worker shares of a run. The last worker absorbs the
/// remainder; empty shares are skipped.
fn worker_shares(count: usize, active: usize) -> Vec<(usize, usize)> {
    let share = count / active;
    let remainder = count % active;
    (0..active)
        .map(|i| {
            let len = if i == active - 1 { share + remainder } else { share };
            (i * share, len)
        })
        .filter(|&(_, len)| len > 0)
        .collect()
}

impl MigrationEngine {
    pub fn new(
        topology: Arc<TierTopology>,
        pool: Arc<WorkerPool>,
        mover: Arc<dyn PageMover>,
        workers_max: usize,
    ) -> MigrationEngine {
        MigrationEngine {
            topology,
            pool,
            mover,
            workers_max,
        }
    }

    /// Pulling into DRAM is latency-critical and parallelized; pushing onto
    /// NVRAM is bandwidth-limited and must not contend.
    fn active_workers(&self, dest: Tier) -> usize {
        match dest {
            Tier::Dram => self.workers_max,
            Tier::Nvram => 1,
        }
    }

    /// Assigns destination nodes to a prefix of `candidates`, walking the
    /// tier's nodes in configured order and taking at most the node's
    /// currently free pages each. Returns one node per assigned candidate.
    fn assign(&self, candidates: &[Candidate], dest: Tier) -> Vec<i32> {
        let mut nodes = Vec::new();
        for &node in self.topology.nodes(dest) {
            if nodes.len() == candidates.len() {
                break;
            }
            let available = match self.topology.node_free_pages(node) {
                Ok(pages) => pages as usize,
                Err(e) => {
                    warn!("skipping node {} in assignment: {}", node, e);
                    continue;
                }
            };
            let take = available.min(candidates.len() - nodes.len());
            nodes.extend(std::iter::repeat(node as i32).take(take));
        }
        if nodes.len() < candidates.len() {
            debug!(
                "dropping {} candidates: no free pages left on {:?}",
                candidates.len() - nodes.len(),
                dest
            );
        }
        nodes
    }

    /// Migrates the assignable prefix of `candidates` towards `dest`.
    /// Returns `(processed, failed)` page counts.
    fn migrate_prefix(&self, candidates: &[Candidate], dest: Tier) -> (usize, usize) {
        let dest_nodes = self.assign(candidates, dest);
        let processed = dest_nodes.len();
        if processed == 0 {
            return (0, 0);
        }
        let prefix = &candidates[..processed];
        let active = self.active_workers(dest);
        let failed = Arc::new(AtomicUsize::new(0));

        let mut offset = 0;
        for (pid, group) in &prefix.iter().group_by(|c| c.pid) {
            let count = group.count();
            for (start, len) in worker_shares(count, active) {
                let share = &prefix[offset + start..offset + start + len];
                let addrs: Vec<u64> = share.iter().map(|c| c.addr).collect();
                let nodes = dest_nodes[offset + start..offset + start + len].to_vec();
                let mover = Arc::clone(&self.mover);
                let failed = Arc::clone(&failed);
                self.pool.submit(Box::new(move || {
                    let begin = Instant::now();
                    match mover.move_pages(pid, &addrs, &nodes) {
                        Ok(_status) => debug!(
                            "move_pages pid={} pages={} took {}ms",
                            pid,
                            addrs.len(),
                            begin.elapsed().as_millis()
                        ),
                        Err(e) => {
                            warn!("move_pages failed for pid={}: {}", pid, e);
                            failed.fetch_add(addrs.len(), Ordering::Relaxed);
                        }
                    }
                }));
            }
            offset += count;
            self.pool.wait();
        }
        (processed, failed.load(Ordering::Relaxed))
    }

    /// Migrates a single-direction batch. Returns the number of pages
    /// submitted and not observed to fail.
    pub fn migrate(&self, candidates: &[Candidate], dest: Tier) -> usize {
        let (processed, failed) = self.migrate_prefix(candidates, dest);
        processed - failed
    }

    /// Runs both directions of a switch batch alternately, re-querying node
    /// space each pass, until neither direction makes progress or all
    /// candidates are consumed. Each direction uses its tier-appropriate
    /// worker count.
    pub fn migrate_switch(&self, batch: &SwitchBatch) -> usize {
        let mut to_nvram_cursor = 0;
        let mut to_dram_cursor = 0;
        let mut migrated = 0;
        let mut nvram_has_space = true;
        let mut dram_has_space = true;

        while (to_nvram_cursor < batch.to_nvram.len() || to_dram_cursor < batch.to_dram.len())
            && (nvram_has_space || dram_has_space)
        {
            let (processed, failed) =
                self.migrate_prefix(&batch.to_nvram[to_nvram_cursor..], Tier::Nvram);
            nvram_has_space = processed > 0;
            to_nvram_cursor += processed;
            migrated += processed - failed;

            let (processed, failed) =
                self.migrate_prefix(&batch.to_dram[to_dram_cursor..], Tier::Dram);
            dram_has_space = processed > 0;
            to_dram_cursor += processed;
            migrated += processed - failed;
        }
        migrated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ControllerConfiguration,
        topology::{page_size, NodeId, SpaceProbe, TopologyError},
    };
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Free pages fixed per node.
    struct FixedProbe {
        free_pages: HashMap<NodeId, u64>,
    }

    impl FixedProbe {
        fn new(free_pages: &[(NodeId, u64)]) -> Self {
            FixedProbe {
                free_pages: free_pages.iter().copied().collect(),
            }
        }
    }

    impl SpaceProbe for FixedProbe {
        fn node_space(&self, node: NodeId) -> Result<(u64, u64), TopologyError> {
            let pages = *self.free_pages.get(&node).unwrap_or(&0);
            Ok((pages * page_size(), 1u64 << 40))
        }
    }

    #[derive(Default)]
    struct RecordingMover {
        calls: Mutex<Vec<(i32, Vec<u64>, Vec<i32>)>>,
    }

    impl PageMover for RecordingMover {
        fn move_pages(
            &self,
            pid: i32,
            addrs: &[u64],
            dest_nodes: &[i32],
        ) -> std::io::Result<Vec<i32>> {
            self.calls
                .lock()
                .push((pid, addrs.to_vec(), dest_nodes.to_vec()));
            Ok(vec![0; addrs.len()])
        }
    }

    fn engine(
        free_pages: &[(NodeId, u64)],
        workers_max: usize,
    ) -> (MigrationEngine, Arc<RecordingMover>) {
        let config = ControllerConfiguration {
            dram_nodes: vec![0],
            nvram_nodes: vec![2, 3],
            ..Default::default()
        };
        let topology = Arc::new(TierTopology::new(
            &config,
            Box::new(FixedProbe::new(free_pages)),
        ));
        let pool = Arc::new(WorkerPool::new(workers_max).unwrap());
        let mover = Arc::new(RecordingMover::default());
        (
            MigrationEngine::new(topology, pool, mover.clone() as Arc<dyn PageMover>, workers_max),
            mover,
        )
    }

    fn candidates(groups: &[(i32, usize)]) -> Vec<Candidate> {
        let mut out = Vec::new();
        for &(pid, count) in groups {
            for _ in 0..count {
                out.push(Candidate {
                    addr: 0x1000 * (out.len() as u64 + 1),
                    pid,
                });
            }
        }
        out
    }

    #[test]
    fn one_syscall_per_pid_run_towards_nvram() {
        // the S2 shape: 3 pages of pid 11 then 2 of pid 22, pushed down
        let (engine, mover) = engine(&[(2, 100), (3, 100)], 4);
        let batch = candidates(&[(11, 3), (22, 2)]);
        let migrated = engine.migrate(&batch, Tier::Nvram);
        assert_eq!(migrated, 5);

        let calls = mover.calls.lock();
        assert_eq!(calls.len(), 2);
        for (pid, addrs, nodes) in calls.iter() {
            assert!(addrs.len() == 3 && *pid == 11 || addrs.len() == 2 && *pid == 22);
            assert!(nodes.iter().all(|n| *n == 2 || *n == 3));
        }
    }

    #[test]
    fn assignment_respects_per_node_capacity() {
        let (engine, mover) = engine(&[(2, 2), (3, 100)], 1);
        let batch = candidates(&[(5, 6)]);
        let migrated = engine.migrate(&batch, Tier::Nvram);
        assert_eq!(migrated, 6);

        let calls = mover.calls.lock();
        let nodes: Vec<i32> = calls.iter().flat_map(|(_, _, n)| n.clone()).collect();
        assert_eq!(nodes.iter().filter(|&&n| n == 2).count(), 2);
        assert_eq!(nodes.iter().filter(|&&n| n == 3).count(), 4);
    }

    #[test]
    fn overflow_beyond_tier_capacity_is_dropped() {
        let (engine, mover) = engine(&[(2, 3), (3, 0)], 1);
        let batch = candidates(&[(5, 10)]);
        let migrated = engine.migrate(&batch, Tier::Nvram);
        assert_eq!(migrated, 3);
        let calls = mover.calls.lock();
        let total: usize = calls.iter().map(|(_, a, _)| a.len()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn dram_runs_are_split_across_workers() {
        let (engine, mover) = engine(&[(0, 1000)], 4);
        let batch = candidates(&[(7, 10)]);
        let migrated = engine.migrate(&batch, Tier::Dram);
        assert_eq!(migrated, 10);

        let calls = mover.calls.lock();
        let mut sizes: Vec<usize> = calls.iter().map(|(_, a, _)| a.len()).collect();
        sizes.sort_unstable();
        // share 2 per worker, last takes the remainder
        assert_eq!(sizes, vec![2, 2, 2, 4]);
        assert!(calls.iter().all(|(pid, _, _)| *pid == 7));
    }

    #[test]
    fn tiny_run_reaches_a_single_worker() {
        let (engine, mover) = engine(&[(0, 1000)], 4);
        let batch = candidates(&[(7, 1)]);
        assert_eq!(engine.migrate(&batch, Tier::Dram), 1);
        assert_eq!(mover.calls.lock().len(), 1);
    }

    #[test]
    fn switch_runs_both_directions() {
        let (engine, mover) = engine(&[(0, 100), (2, 100), (3, 100)], 1);
        let batch = SwitchBatch {
            to_dram: candidates(&[(1, 2)]),
            to_nvram: candidates(&[(2, 2)]),
            retval: 0,
        };
        let migrated = engine.migrate_switch(&batch);
        assert_eq!(migrated, 4);

        let calls = mover.calls.lock();
        assert_eq!(calls.len(), 2);
        // pushed pages land on NVRAM nodes, pulled pages on the DRAM node
        for (pid, _, nodes) in calls.iter() {
            match pid {
                2 => assert!(nodes.iter().all(|n| *n == 2 || *n == 3)),
                1 => assert!(nodes.iter().all(|n| *n == 0)),
                _ => panic!("unexpected pid"),
            }
        }
    }

    #[test]
    fn switch_terminates_when_one_tier_is_full() {
        let (engine, mover) = engine(&[(0, 100), (2, 0), (3, 0)], 1);
        let batch = SwitchBatch {
            to_dram: candidates(&[(1, 2)]),
            to_nvram: candidates(&[(2, 2)]),
            retval: 0,
        };
        // must not spin: the NVRAM direction can never progress
        let migrated = engine.migrate_switch(&batch);
        assert_eq!(migrated, 2);
        assert_eq!(mover.calls.lock().len(), 1);
    }

    mod properties {
        use super::*;
        use quickcheck_macros::quickcheck;

        #[quickcheck]
        fn shares_cover_the_run(count: usize, active: usize) -> bool {
            let count = count % 10_000;
            let active = active % 64 + 1;
            let shares = worker_shares(count, active);
            let total: usize = shares.iter().map(|&(_, len)| len).sum();
            let contiguous = shares
                .windows(2)
                .all(|w| w[0].0 + w[0].1 == w[1].0);
            total == count && shares.len() <= active && contiguous
        }
    }
}
