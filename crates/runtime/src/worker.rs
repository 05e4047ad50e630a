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

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Epoch, Rank, ShardId, TableId};
use table::Registry;
use tokio::sync::Mutex;
use transport::{Message, Transport};

use crate::error::{Result, RuntimeError};
use crate::kernel::{Kernel, KernelRegistry};
use crate::task::Task;

const STATS_INTERVAL: Duration = Duration::from_millis(100);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Per-process loop: drains master commands, executes kernel methods on
/// assigned shards, polls peers, applies inbound puts, answers inbound
/// gets, drains outbound write buffers (spec.md §4.4). Realized as a
/// single Tokio task driving a polling loop rather than a network thread
/// plus a kernel thread plus locks (spec.md §9's concurrency redesign
/// note) — there is never more than one kernel invocation in flight per
/// worker, so no lock is needed around task execution itself.
pub struct WorkerRuntime {
    rank: Rank,
    transport: Arc<dyn Transport>,
    table_registry: Arc<Registry>,
    kernels: KernelRegistry,
    kernel_cache: Mutex<HashMap<(String, TableId, ShardId), Arc<dyn Kernel>>>,
    pending_tasks: Mutex<VecDeque<Task>>,
    epoch: Mutex<Epoch>,
    stats: Arc<common::Stats>,
}

impl WorkerRuntime {
    pub fn new(
        rank: Rank,
        transport: Arc<dyn Transport>,
        table_registry: Arc<Registry>,
        kernels: KernelRegistry,
    ) -> Arc<Self> {
        let stats = Arc::new(common::Stats::default());
        table_registry.set_stats(stats.clone());
        Arc::new(Self {
            rank,
            transport,
            table_registry,
            kernels,
            kernel_cache: Mutex::new(HashMap::new()),
            pending_tasks: Mutex::new(VecDeque::new()),
            epoch: Mutex::new(Epoch::default()),
            stats,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn stats(&self) -> Arc<common::Stats> {
        self.stats.clone()
    }

    /// Runs until a `WorkerShutdown` message arrives.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        tracing::info!(rank = %self.rank, "worker runtime starting");
        let mut last_stats = Instant::now();

        loop {
            while let Some((from, msg)) = self.transport.try_recv() {
                if !self.handle_message(from, msg).await? {
                    tracing::info!(rank = %self.rank, "worker runtime shutting down");
                    return Ok(());
                }
            }

            let next_task = self.pending_tasks.lock().await.pop_front();
            match next_task {
                Some(task) => self.execute_task(task).await?,
                None => tokio::time::sleep(IDLE_POLL_INTERVAL).await,
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                tracing::debug!(rank = %self.rank, stats = ?self.stats.snapshot(), "liveness report");
                last_stats = Instant::now();
            }
        }
    }

    /// Returns `false` when the loop should stop.
    async fn handle_message(&self, from: Rank, msg: Message) -> Result<bool> {
        match msg {
            Message::RunKernel {
                kernel,
                method,
                table,
                shard,
                epoch,
                parameters,
            } => {
                *self.epoch.lock().await = epoch;
                self.pending_tasks.lock().await.push_back(Task {
                    table_id: table,
                    shard_id: shard,
                    kernel_name: kernel,
                    method_name: method,
                    epoch,
                    parameters,
                });
            }
            Message::Barrier { .. } => {
                self.transport.send(from, Message::Ack).await?;
            }
            Message::WorkerShutdown => return Ok(false),
            other => {
                match &other {
                    Message::PutRequest { batch, .. } => {
                        let bytes: usize = batch.iter().map(|e| e.key.len() + e.value.len()).sum();
                        self.stats.record_put_in(bytes);
                    }
                    Message::GetRequest { .. } => self.stats.record_get_in(),
                    _ => {}
                }

                // `sync_broadcast` callers (shard reassignment, checkpoint
                // start/finish, restore, clear, swap, trigger toggling)
                // block on one `Ack` per peer; every such kind gets one
                // here once the table registry has applied it, regardless
                // of whether any table actually claimed it.
                let needs_ack = other.needs_ack();
                let consumed = self.table_registry.route(from, other.clone()).await?;
                if !consumed {
                    tracing::warn!(?other, %from, "message claimed by no registered table");
                }
                if needs_ack {
                    self.transport.send(from, Message::Ack).await?;
                }
            }
        }
        Ok(true)
    }

    async fn execute_task(self: &Arc<Self>, task: Task) -> Result<()> {
        let cache_key = (task.kernel_name.clone(), task.table_id, task.shard_id);
        let kernel = {
            let mut cache = self.kernel_cache.lock().await;
            if let Some(kernel) = cache.get(&cache_key) {
                kernel.clone()
            } else {
                let instance = self
                    .kernels
                    .instantiate(&task.kernel_name, task.table_id, task.shard_id)
                    .ok_or_else(|| RuntimeError::UnknownKernel(task.kernel_name.clone()))?;
                cache.insert(cache_key, instance.clone());
                instance
            }
        };

        kernel
            .invoke(&task.method_name, task.shard_id, &self.table_registry, &task.parameters)
            .await
            .map_err(RuntimeError::KernelFailed)?;

        // Every send this task produced must drain before done is
        // reported, so the master's completion count implies write
        // quiescence for this task's writer (spec.md §4.4 invariant).
        self.table_registry.flush_all(task.epoch).await?;

        self.transport
            .send(
                Rank::MASTER,
                Message::KernelDone {
                    table: task.table_id,
                    shard: task.shard_id,
                    kernel: task.kernel_name.clone(),
                    method: task.method_name.clone(),
                    epoch: task.epoch,
                },
            )
            .await?;

        Ok(())
    }
}
