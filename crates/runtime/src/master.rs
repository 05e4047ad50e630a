// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Epoch, Rank, ShardId, TableId};
use store::ByteStore;
use tokio::sync::Mutex;
use transport::{Message, Transport};

use crate::error::{Result, RuntimeError};
use crate::run_descriptor::{CheckpointPolicy, RunDescriptor, RunScope};
use crate::task::Task;

/// A worker's queue of not-yet-dispatched shards plus whatever it is
/// currently running. The master only ever has one outstanding task per
/// worker in flight (spec.md §4.4: a worker executes at most one kernel
/// invocation at a time), so stealing only ever moves *pending* shards —
/// nothing already sent to a worker is ever re-sent elsewhere.
#[derive(Default)]
struct WorkerState {
    pending: VecDeque<Task>,
    outstanding: Option<(Task, Instant)>,
    mean_task_time: Duration,
    samples: u32,
}

/// Rank 0's view of the job: shard assignment, per-worker queues, running
/// mean task times, and checkpoint epoch (spec.md §4.5/§4.6). The master
/// owns no shards of its own; every shard belongs to some rank in
/// `worker_ranks`.
pub struct MasterRuntime {
    transport: Arc<dyn Transport>,
    store: Arc<dyn ByteStore>,
    worker_ranks: Vec<Rank>,
    table_shard_counts: Mutex<HashMap<TableId, u32>>,
    assignment: Mutex<HashMap<(TableId, ShardId), Rank>>,
    workers: Mutex<HashMap<Rank, WorkerState>>,
    checkpoint_epoch: Mutex<Epoch>,
}

impl MasterRuntime {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn ByteStore>, worker_ranks: Vec<Rank>) -> Arc<Self> {
        assert!(!worker_ranks.is_empty(), "a job needs at least one worker");
        Arc::new(Self {
            transport,
            store,
            worker_ranks,
            table_shard_counts: Mutex::new(HashMap::new()),
            assignment: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            checkpoint_epoch: Mutex::new(Epoch::default()),
        })
    }

    pub fn worker_ranks(&self) -> &[Rank] {
        &self.worker_ranks
    }

    /// Records a table's shard count so later runs against it can compute a
    /// task list without needing the table itself (the master never opens
    /// a `GlobalTable` — it only schedules work against shards by number).
    /// Register every table a job's kernels touch, even ones that never
    /// serve as a run's locality table: shard assignment is broadcast to
    /// every registered table sharing a shard count, so a kernel reaching
    /// several tables from one task needs them all registered up front to
    /// receive the same owner for shard `i`.
    pub async fn register_table(&self, table: TableId, shard_count: u32) {
        self.table_shard_counts.lock().await.insert(table, shard_count);
    }

    async fn shard_count(&self, table: TableId) -> Result<u32> {
        self.table_shard_counts
            .lock()
            .await
            .get(&table)
            .copied()
            .ok_or(RuntimeError::UnknownTable(table))
    }

    fn resolve_scope(scope: &RunScope, shard_count: u32) -> Vec<ShardId> {
        match scope {
            RunScope::All => (0..shard_count).map(ShardId).collect(),
            RunScope::One => vec![ShardId(0)],
            RunScope::Range(shards) => shards.clone(),
        }
    }

    /// Round-robins any shard of `table` that has never been assigned an
    /// owner. Shards already assigned keep their owner — sticky placement,
    /// per spec.md §4.5 — unless `maybe_steal_work` moves one later. The
    /// same shard -> rank mapping is applied to every other registered
    /// table sharing `shard_count`, since Shard Assignment is a single
    /// `shard_id -> rank` mapping shared by every co-sharded table (spec.md
    /// §4.5: "preserving locality for tables sharing a shard function") —
    /// a kernel that reaches several tables from one task needs all of
    /// them to agree on who owns shard `i`.
    async fn ensure_assignment(&self, table: TableId, shard_count: u32) -> Result<()> {
        let new_owners: Vec<(ShardId, Rank)> = {
            let mut assignment = self.assignment.lock().await;
            let mut out = Vec::new();
            for i in 0..shard_count {
                let shard = ShardId(i);
                if let std::collections::hash_map::Entry::Vacant(slot) = assignment.entry((table, shard)) {
                    let owner = self.worker_ranks[i as usize % self.worker_ranks.len()];
                    slot.insert(owner);
                    out.push((shard, owner));
                }
            }
            out
        };
        if new_owners.is_empty() {
            return Ok(());
        }

        let co_located: Vec<TableId> = {
            let counts = self.table_shard_counts.lock().await;
            counts
                .iter()
                .filter(|(&t, &c)| t != table && c == shard_count)
                .map(|(&t, _)| t)
                .collect()
        };

        let mut broadcast_entries: Vec<(TableId, ShardId, Rank)> =
            new_owners.iter().map(|&(shard, owner)| (table, shard, owner)).collect();
        if !co_located.is_empty() {
            let mut assignment = self.assignment.lock().await;
            for &other in &co_located {
                for &(shard, owner) in &new_owners {
                    assignment.entry((other, shard)).or_insert(owner);
                    broadcast_entries.push((other, shard, owner));
                }
            }
        }

        tracing::info!(table = %table, count = broadcast_entries.len(), "assigning shards");
        self.transport
            .sync_broadcast(&self.worker_ranks, Message::ShardAssignment { assignment: broadcast_entries })
            .await?;
        Ok(())
    }

    /// Sends the next queued task to every worker that is currently idle.
    async fn pump_idle_workers(&self) -> Result<()> {
        let to_send: Vec<(Rank, Task)> = {
            let mut workers = self.workers.lock().await;
            let mut out = Vec::new();
            for (rank, state) in workers.iter_mut() {
                if state.outstanding.is_none() {
                    if let Some(task) = state.pending.pop_front() {
                        out.push((*rank, task.clone()));
                        state.outstanding = Some((task, Instant::now()));
                    }
                }
            }
            out
        };

        for (rank, task) in to_send {
            self.transport
                .send(
                    rank,
                    Message::RunKernel {
                        kernel: task.kernel_name.clone(),
                        method: task.method_name.clone(),
                        table: task.table_id,
                        shard: task.shard_id,
                        epoch: task.epoch,
                        parameters: task.parameters.clone(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Records a `KernelDone` against whichever task `from` had outstanding.
    /// A done-message whose shard doesn't match what we think is running is
    /// a stale duplicate and is ignored rather than corrupting the timer.
    async fn complete_outstanding(&self, from: Rank, shard: ShardId) {
        let mut workers = self.workers.lock().await;
        let Some(state) = workers.get_mut(&from) else { return };
        let Some((task, started)) = state.outstanding.take() else { return };
        if task.shard_id != shard {
            state.outstanding = Some((task, started));
            return;
        }
        let elapsed = started.elapsed();
        state.samples += 1;
        state.mean_task_time = if state.samples == 1 {
            elapsed
        } else {
            (state.mean_task_time + elapsed) / 2
        };
    }

    /// If one worker sits idle while another's in-flight task has run past
    /// twice the fleet's average, moves one of the slow worker's not-yet-
    /// started shards over to the idle one (spec.md §4.5 work stealing).
    async fn maybe_steal_work(&self) -> Result<()> {
        let stolen = {
            let mut workers = self.workers.lock().await;

            let idle_rank = workers
                .iter()
                .find(|(_, s)| s.outstanding.is_none() && s.pending.is_empty())
                .map(|(r, _)| *r);
            let Some(idle_rank) = idle_rank else { return Ok(()) };

            let (sum, n) = workers
                .values()
                .filter(|s| s.samples > 0)
                .fold((Duration::ZERO, 0u32), |(sum, n), s| (sum + s.mean_task_time, n + 1));
            if n == 0 {
                return Ok(());
            }
            let average = sum / n;
            if average.is_zero() {
                return Ok(());
            }

            let now = Instant::now();
            let slow_rank = workers
                .iter()
                .filter(|(r, s)| **r != idle_rank && !s.pending.is_empty())
                .find(|(_, s)| matches!(&s.outstanding, Some((_, started)) if now.duration_since(*started) > average * 2))
                .map(|(r, _)| *r);
            let Some(slow_rank) = slow_rank else { return Ok(()) };

            let task = workers.get_mut(&slow_rank).and_then(|s| s.pending.pop_front());
            let Some(task) = task else { return Ok(()) };

            workers.entry(idle_rank).or_default().pending.push_back(task.clone());
            Some((task, slow_rank, idle_rank))
        };

        if let Some((task, slow_rank, idle_rank)) = stolen {
            tracing::info!(
                shard = %task.shard_id,
                from = %slow_rank,
                to = %idle_rank,
                "stealing work from a lagging worker"
            );

            let shard_count = self.shard_count(task.table_id).await.ok();
            let co_located: Vec<TableId> = match shard_count {
                Some(count) => {
                    let counts = self.table_shard_counts.lock().await;
                    counts
                        .iter()
                        .filter(|(&t, &c)| t != task.table_id && c == count)
                        .map(|(&t, _)| t)
                        .collect()
                }
                None => Vec::new(),
            };

            let mut broadcast_entries = vec![(task.table_id, task.shard_id, idle_rank)];
            {
                let mut assignment = self.assignment.lock().await;
                assignment.insert((task.table_id, task.shard_id), idle_rank);
                for &other in &co_located {
                    assignment.insert((other, task.shard_id), idle_rank);
                    broadcast_entries.push((other, task.shard_id, idle_rank));
                }
            }

            // `slow_rank` is mid-task inside `WorkerRuntime::execute_task`
            // and cannot reach its message loop to ack anything until that
            // task returns — exactly the worker this steal is routing
            // around. Waiting on its ack here would block the steal on the
            // straggler it exists to avoid. Tell it what happened
            // fire-and-forget (it applies the reassignment whenever it next
            // polls, same as any other queued message) and only
            // sync-broadcast, with acks, to the ranks that can actually
            // answer right now.
            let ack_ranks: Vec<Rank> = self.worker_ranks.iter().copied().filter(|&r| r != slow_rank).collect();
            let reassignment = Message::ShardAssignment {
                assignment: broadcast_entries,
            };
            self.transport.send(slow_rank, reassignment.clone()).await?;
            if !ack_ranks.is_empty() {
                self.transport.sync_broadcast(&ack_ranks, reassignment).await?;
            }
        }

        Ok(())
    }

    /// Drives one `run_all`/`run_one`/`run_range` round to completion:
    /// assigns shards, dispatches a task per shard, collects every
    /// completion (stealing work from stragglers as it goes), then — if
    /// asked — waits for a barrier and/or checkpoints (spec.md §4.5).
    pub async fn dispatch(&self, run: &RunDescriptor) -> Result<()> {
        let shard_count = self.shard_count(run.locality_table_id).await?;
        let shards = Self::resolve_scope(&run.scope, shard_count);
        if shards.is_empty() {
            return Ok(());
        }

        self.ensure_assignment(run.locality_table_id, shard_count).await?;
        let epoch = *self.checkpoint_epoch.lock().await;

        {
            let assignment = self.assignment.lock().await;
            let mut workers = self.workers.lock().await;
            for &shard in &shards {
                let owner = *assignment
                    .get(&(run.locality_table_id, shard))
                    .expect("ensure_assignment populated every shard above");
                workers.entry(owner).or_default().pending.push_back(Task {
                    table_id: run.locality_table_id,
                    shard_id: shard,
                    kernel_name: run.kernel_name.clone(),
                    method_name: run.method_name.clone(),
                    epoch,
                    parameters: run.parameters.clone(),
                });
            }
        }

        let total = shards.len();
        let mut completed: HashSet<ShardId> = HashSet::new();

        self.pump_idle_workers().await?;

        while completed.len() < total {
            let (from, msg) = self.transport.recv().await?;
            match msg {
                Message::KernelDone { table, shard, .. } if table == run.locality_table_id => {
                    self.complete_outstanding(from, shard).await;
                    completed.insert(shard);
                    self.maybe_steal_work().await?;
                    self.pump_idle_workers().await?;
                }
                other => {
                    tracing::trace!(kind = other.kind(), %from, "master ignoring unrelated message mid-dispatch");
                }
            }
        }

        if run.barrier {
            self.transport
                .sync_broadcast(&self.worker_ranks, Message::Barrier { token: epoch.0 })
                .await?;
        }

        if let CheckpointPolicy::AfterRun { prefix } = &run.checkpoint_policy {
            self.checkpoint(&run.checkpoint_tables, prefix).await?;
        }

        Ok(())
    }

    /// Advances the checkpoint epoch, tells every worker to start diverting
    /// new writes to a delta log and snapshot their local shards, persists
    /// a manifest, then releases the epoch fence (spec.md §4.6). Callable
    /// mid-run: `dispatch` always waits out a run's tasks (and their
    /// writer flushes) before returning, so by the time a caller can call
    /// `checkpoint` the network is already quiescent for every prior task.
    pub async fn checkpoint(&self, tables: &[TableId], prefix: &str) -> Result<()> {
        let epoch = {
            let mut guard = self.checkpoint_epoch.lock().await;
            *guard = guard.next();
            *guard
        };

        tracing::info!(%epoch, prefix, "starting checkpoint");

        self.transport
            .sync_broadcast(
                &self.worker_ranks,
                Message::StartCheckpoint {
                    epoch,
                    tables: tables.to_vec(),
                    prefix: prefix.to_string(),
                    parameters: Vec::new(),
                },
            )
            .await?;

        self.write_manifest(epoch, tables, prefix)?;

        self.transport
            .sync_broadcast(&self.worker_ranks, Message::FinishCheckpoint { epoch })
            .await?;

        tracing::info!(%epoch, prefix, "checkpoint finished");
        Ok(())
    }

    fn write_manifest(&self, epoch: Epoch, tables: &[TableId], prefix: &str) -> Result<()> {
        let path = store::manifest_path(prefix);
        let table_ids: Vec<u32> = tables.iter().map(|t| t.0).collect();
        let body = bincode::encode_to_vec((epoch.0, &table_ids), common::bincode_config())
            .map_err(|e| RuntimeError::InvariantViolation(format!("manifest encode failed: {e}")))?;
        let mut writer = self.store.open_write(&path)?;
        writer.write_entry(b"manifest", &body)?;
        writer.flush()?;
        Ok(())
    }

    /// Tells every worker to replace its owned shards of `tables` with the
    /// snapshot plus delta log found under `prefix` for `epoch` (spec.md
    /// §4.6/§9): restore always applies as a replace-log, regardless of
    /// each table's live accumulator, matching the original system's
    /// behavior rather than its accumulator-aware-replay bug.
    pub async fn restore(&self, epoch: Epoch, tables: &[TableId], prefix: &str) -> Result<()> {
        tracing::info!(%epoch, prefix, "restoring from checkpoint");
        self.transport
            .sync_broadcast(
                &self.worker_ranks,
                Message::Restore {
                    epoch,
                    tables: tables.to_vec(),
                    prefix: prefix.to_string(),
                },
            )
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        for &rank in &self.worker_ranks {
            self.transport.send(rank, Message::WorkerShutdown).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::TcpTransport;

    async fn pair(base_port: u16) -> (Arc<TcpTransport>, Arc<TcpTransport>) {
        let addrs: Vec<std::net::SocketAddr> = vec![
            format!("127.0.0.1:{base_port}").parse().unwrap(),
            format!("127.0.0.1:{}", base_port + 1).parse().unwrap(),
        ];
        let master = TcpTransport::bind(Rank(0), addrs.clone()).await.unwrap();
        let worker = TcpTransport::bind(Rank(1), addrs).await.unwrap();
        (master, worker)
    }

    #[tokio::test]
    async fn assigns_unassigned_shards_round_robin() {
        let (master_t, worker_t) = pair(28410).await;
        let store = Arc::new(store::LocalFileStore::new(std::env::temp_dir().join("master-test-assign")).unwrap());
        let master = MasterRuntime::new(master_t, store, vec![Rank(1)]);
        master.register_table(TableId(1), 4).await;

        let worker_task = tokio::spawn(async move {
            let (from, msg) = worker_t.recv().await.unwrap();
            assert!(matches!(msg, Message::ShardAssignment { .. }));
            worker_t.send(from, Message::Ack).await.unwrap();
        });

        master.ensure_assignment(TableId(1), 4).await.unwrap();
        worker_task.await.unwrap();

        let assignment = master.assignment.lock().await;
        assert_eq!(assignment.len(), 4);
        for (_, owner) in assignment.iter() {
            assert_eq!(*owner, Rank(1));
        }
    }

    #[tokio::test]
    async fn assigning_one_table_also_assigns_every_table_sharing_its_shard_count() {
        let (master_t, worker_t) = pair(28420).await;
        let store = Arc::new(store::LocalFileStore::new(std::env::temp_dir().join("master-test-colocate")).unwrap());
        let master = MasterRuntime::new(master_t, store, vec![Rank(1)]);
        master.register_table(TableId(1), 2).await;
        master.register_table(TableId(2), 2).await;
        master.register_table(TableId(3), 5).await;

        let worker_task = tokio::spawn(async move {
            let (from, msg) = worker_t.recv().await.unwrap();
            let Message::ShardAssignment { assignment } = msg else {
                panic!("expected a ShardAssignment message");
            };
            assert_eq!(assignment.len(), 4, "2 shards for table 1 plus 2 shards for the co-sharded table 2");
            worker_t.send(from, Message::Ack).await.unwrap();
        });

        master.ensure_assignment(TableId(1), 2).await.unwrap();
        worker_task.await.unwrap();

        let assignment = master.assignment.lock().await;
        assert_eq!(assignment.get(&(TableId(1), ShardId(0))), Some(&Rank(1)));
        assert_eq!(assignment.get(&(TableId(2), ShardId(0))), Some(&Rank(1)));
        assert_eq!(assignment.get(&(TableId(2), ShardId(1))), Some(&Rank(1)));
        assert!(!assignment.contains_key(&(TableId(3), ShardId(0))), "table 3 has a different shard count");
    }

    async fn trio(base_port: u16) -> (Arc<TcpTransport>, Arc<TcpTransport>, Arc<TcpTransport>) {
        let addrs: Vec<std::net::SocketAddr> = (0..3)
            .map(|i| format!("127.0.0.1:{}", base_port + i).parse().unwrap())
            .collect();
        let master = TcpTransport::bind(Rank(0), addrs.clone()).await.unwrap();
        let w1 = TcpTransport::bind(Rank(1), addrs.clone()).await.unwrap();
        let w2 = TcpTransport::bind(Rank(2), addrs).await.unwrap();
        (master, w1, w2)
    }

    /// spec.md §8 S5: one worker runs far past the fleet's mean task time
    /// while another sits idle with nothing outstanding; `maybe_steal_work`
    /// reassigns one of the slow worker's *pending* (not yet started)
    /// shards to the idle one and broadcasts the new owner.
    #[tokio::test]
    async fn steals_a_pending_shard_from_a_lagging_worker() {
        let (master_t, w1_t, w2_t) = trio(28430).await;
        let store = Arc::new(store::LocalFileStore::new(std::env::temp_dir().join("master-test-steal")).unwrap());
        let master = MasterRuntime::new(master_t, store, vec![Rank(1), Rank(2)]);
        master.register_table(TableId(9), 4).await;

        let stuck_task = Task {
            table_id: TableId(9),
            shard_id: ShardId(0),
            kernel_name: "k".into(),
            method_name: "m".into(),
            epoch: Epoch(0),
            parameters: Vec::new(),
        };
        let pending_task = Task {
            table_id: TableId(9),
            shard_id: ShardId(1),
            kernel_name: "k".into(),
            method_name: "m".into(),
            epoch: Epoch(0),
            parameters: Vec::new(),
        };

        {
            let mut workers = master.workers.lock().await;
            let slow = workers.entry(Rank(1)).or_default();
            slow.mean_task_time = Duration::from_millis(5);
            slow.samples = 1;
            slow.outstanding = Some((stuck_task.clone(), Instant::now() - Duration::from_millis(50)));
            slow.pending.push_back(pending_task.clone());

            workers.entry(Rank(2)).or_default();
        }
        {
            let mut assignment = master.assignment.lock().await;
            assignment.insert((TableId(9), ShardId(0)), Rank(1));
            assignment.insert((TableId(9), ShardId(1)), Rank(1));
        }

        // Rank(1) is the straggler the steal is routing around: it is
        // modeled as genuinely stuck inside a long kernel call, so nothing
        // here ever reads from `w1_t` or acks on its behalf. If
        // `maybe_steal_work` waited on an ack from the rank it is stealing
        // from, this call would hang; it must complete using only Rank(2)'s
        // ack.
        let ack_idle = tokio::spawn(async move {
            let (from, msg) = w2_t.recv().await.unwrap();
            assert!(matches!(msg, Message::ShardAssignment { .. }));
            w2_t.send(from, Message::Ack).await.unwrap();
        });

        tokio::time::timeout(Duration::from_secs(5), master.maybe_steal_work())
            .await
            .expect("maybe_steal_work must not block on the straggler's ack")
            .unwrap();
        ack_idle.await.unwrap();

        // The straggler still got the reassignment, just without anyone
        // waiting on its ack.
        let (from, msg) = w1_t.recv().await.unwrap();
        assert!(matches!(msg, Message::ShardAssignment { .. }));
        assert_eq!(from, Rank(0));

        let assignment = master.assignment.lock().await;
        assert_eq!(assignment.get(&(TableId(9), ShardId(1))), Some(&Rank(2)));
        assert_eq!(
            assignment.get(&(TableId(9), ShardId(0))),
            Some(&Rank(1)),
            "the already-dispatched (outstanding) shard is never moved"
        );

        let workers = master.workers.lock().await;
        assert!(workers[&Rank(1)].pending.is_empty(), "stolen shard left the slow worker's queue");
        assert_eq!(workers[&Rank(2)].pending.len(), 1, "and landed in the idle worker's queue");
    }
}
