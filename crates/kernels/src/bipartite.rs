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

//! Bipartite matching by trigger-mediated proposal/veto, grounded directly
//! in `examples/bipartmatch-trigger.cc`'s `BPMTKernel`,
//! `MatchRequestTrigger` and `MatchDenyTrigger`.
//!
//! Left vertices propose a (uncommitted) match to a right vertex by
//! writing into `right_matches`; `MatchRequestTrigger` arbitrates
//! conflicting proposals there using `right_costs`, vetoing (and enqueuing
//! a denial) the loser. `RightBpmt` additionally sweeps for the case where
//! parallel shards raced each other onto the same right vertex before the
//! trigger saw either proposal; the resulting denial fires
//! `MatchDenyTrigger` on `left_matches`, which removes the exhausted edge
//! and re-proposes from the same left vertex's remaining candidates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Rank, ShardId, TableId};
use rand::Rng;
use runtime::{Kernel, KernelFactory};
use store::ByteStore;
use table::{Accumulator, BincodeCodec, GlobalTable, Registry, Sharder, TableDescriptor, Trigger};
use transport::Transport;

use crate::replace::Repl;

pub const LEFT_OUT_EDGES: TableId = TableId(0);
pub const LEFT_MATCHES: TableId = TableId(1);
pub const RIGHT_MATCHES: TableId = TableId(2);
pub const LEFT_OUT_COSTS: TableId = TableId(3);
pub const RIGHT_COSTS: TableId = TableId(4);
pub const MATCH_STATS: TableId = TableId(10_000);

const NO_MATCH: i64 = -1;
const MAX_COST: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, bincode::Encode, bincode::Decode)]
pub struct BpmtParams {
    pub left_vertices: u32,
    pub right_vertices: u32,
    pub edge_probability: f64,
    pub edge_costs: bool,
}

type EdgeTable = GlobalTable<i64, Repl<Vec<i64>>>;
type MatchTable = GlobalTable<i64, i64>;
type StatsTable = GlobalTable<String, Repl<String>>;

/// Every table this kernel touches, resolved from the `Registry` passed
/// into `Kernel::invoke` rather than held directly — the kernel instance
/// itself carries no table references. Kernels reach tables only through
/// the Registry handle they're given.
struct Tables {
    left_edges: Arc<EdgeTable>,
    left_costs: Arc<EdgeTable>,
    left_matches: Arc<MatchTable>,
    right_matches: Arc<MatchTable>,
    right_costs: Arc<MatchTable>,
    stats: Arc<StatsTable>,
}

impl Tables {
    fn lookup(registry: &Registry) -> anyhow::Result<Self> {
        Ok(Self {
            left_edges: registry.get(LEFT_OUT_EDGES).ok_or_else(|| missing("leftoutedges"))?,
            left_costs: registry.get(LEFT_OUT_COSTS).ok_or_else(|| missing("leftoutcosts"))?,
            left_matches: registry.get(LEFT_MATCHES).ok_or_else(|| missing("leftmatches"))?,
            right_matches: registry.get(RIGHT_MATCHES).ok_or_else(|| missing("rightmatches"))?,
            right_costs: registry.get(RIGHT_COSTS).ok_or_else(|| missing("rightcosts"))?,
            stats: registry.get(MATCH_STATS).ok_or_else(|| missing("statstable"))?,
        })
    }
}

fn missing(name: &str) -> anyhow::Error {
    anyhow::anyhow!("bipartite matching table {name:?} was not registered on this worker")
}

/// Constructs and registers the six bipartite-matching tables and the two
/// triggers for one worker rank. `assignment` starts empty; the master
/// broadcasts `ShardAssignment` once it has assigned the job's shards.
pub async fn build_tables(
    rank: Rank,
    shard_count: u32,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ByteStore>,
    registry: &Arc<Registry>,
    edge_costs: bool,
) -> anyhow::Result<(u32, u32)> {
    let left_edges = Arc::new(GlobalTable::new(
        TableDescriptor::new(
            LEFT_OUT_EDGES,
            shard_count,
            Arc::new(BincodeCodec),
            Arc::new(BincodeCodec),
            Sharder::Modulo,
            Accumulator::Replace,
        ),
        rank,
        transport.clone(),
        store.clone(),
        HashMap::new(),
    ));
    let left_costs = Arc::new(GlobalTable::new(
        TableDescriptor::new(
            LEFT_OUT_COSTS,
            shard_count,
            Arc::new(BincodeCodec),
            Arc::new(BincodeCodec),
            Sharder::Modulo,
            Accumulator::Replace,
        ),
        rank,
        transport.clone(),
        store.clone(),
        HashMap::new(),
    ));
    let left_matches = Arc::new(GlobalTable::new(
        TableDescriptor::new(
            LEFT_MATCHES,
            shard_count,
            Arc::new(BincodeCodec),
            Arc::new(BincodeCodec),
            Sharder::Modulo,
            Accumulator::Replace,
        ),
        rank,
        transport.clone(),
        store.clone(),
        HashMap::new(),
    ));
    let right_matches = Arc::new(GlobalTable::new(
        TableDescriptor::new(
            RIGHT_MATCHES,
            shard_count,
            Arc::new(BincodeCodec),
            Arc::new(BincodeCodec),
            Sharder::Modulo,
            Accumulator::Replace,
        ),
        rank,
        transport.clone(),
        store.clone(),
        HashMap::new(),
    ));
    let right_costs = Arc::new(GlobalTable::new(
        TableDescriptor::new(
            RIGHT_COSTS,
            shard_count,
            Arc::new(BincodeCodec),
            Arc::new(BincodeCodec),
            Sharder::Modulo,
            Accumulator::Replace,
        ),
        rank,
        transport.clone(),
        store.clone(),
        HashMap::new(),
    ));
    let stats = Arc::new(GlobalTable::new(
        TableDescriptor::new(
            MATCH_STATS,
            1,
            Arc::new(BincodeCodec),
            Arc::new(BincodeCodec),
            Sharder::StringHash,
            Accumulator::Replace,
        ),
        rank,
        transport,
        store,
        HashMap::new(),
    ));

    registry.register(left_edges.clone());
    registry.register(left_costs.clone());
    registry.register(left_matches.clone());
    registry.register(right_matches.clone());
    registry.register(right_costs.clone());
    registry.register(stats);

    let match_request_id = right_matches.register_trigger(Box::new(MatchRequestTrigger)).await;
    let match_deny_id = left_matches.register_trigger(Box::new(MatchDenyTrigger { edge_costs })).await;
    Ok((match_request_id, match_deny_id))
}

/// Registered on `right_matches`. Arbitrates a proposed left-to-right
/// match against whatever is already there, using the proposer's edge
/// cost to decide who keeps the right vertex.
struct MatchRequestTrigger;

#[async_trait]
impl Trigger<i64, i64> for MatchRequestTrigger {
    async fn fire(&self, registry: &Registry, key: &i64, current: Option<&i64>, proposed: &mut i64) -> bool {
        let right = *key;
        let candidate_left = *proposed;

        let mut new_cost = MAX_COST;
        if candidate_left != NO_MATCH {
            let edges: Option<Arc<EdgeTable>> = registry.get(LEFT_OUT_EDGES);
            let costs: Option<Arc<EdgeTable>> = registry.get(LEFT_OUT_COSTS);
            if let (Some(edges), Some(costs)) = (edges, costs) {
                let v = edges.get(&candidate_left).await.map(|e| e.0).unwrap_or_default();
                let v2 = costs.get(&candidate_left).await.map(|e| e.0).unwrap_or_default();
                if let Some(idx) = v.iter().position(|&r| r == right) {
                    new_cost = v2.get(idx).copied().unwrap_or(MAX_COST);
                }
            }
        }

        let existing = current.copied().unwrap_or(NO_MATCH);
        if existing == NO_MATCH {
            if let Some(right_costs) = registry.get::<i64, i64>(RIGHT_COSTS) {
                let _ = right_costs.enqueue_update(right, new_cost).await;
            }
            return true;
        }

        let held_cost = match registry.get::<i64, i64>(RIGHT_COSTS) {
            Some(t) => t.get(&right).await.unwrap_or(MAX_COST),
            None => MAX_COST,
        };

        let Some(left_matches) = registry.get::<i64, i64>(LEFT_MATCHES) else {
            return false;
        };

        if new_cost < held_cost {
            let _ = left_matches.enqueue_update(existing, NO_MATCH).await;
            if let Some(right_costs) = registry.get::<i64, i64>(RIGHT_COSTS) {
                let _ = right_costs.enqueue_update(right, new_cost).await;
            }
            true
        } else {
            let _ = left_matches.enqueue_update(candidate_left, NO_MATCH).await;
            false
        }
    }
}

/// Registered on `left_matches`. A write of `-1` means some right vertex
/// just denied this left vertex's match; drop the exhausted edge and
/// re-propose from what's left, same as the source's `Fire` (removal
/// enqueued before the replacement proposal).
struct MatchDenyTrigger {
    edge_costs: bool,
}

#[async_trait]
impl Trigger<i64, i64> for MatchDenyTrigger {
    async fn fire(&self, registry: &Registry, key: &i64, current: Option<&i64>, proposed: &mut i64) -> bool {
        if *proposed != NO_MATCH {
            return true;
        }
        let left = *key;
        let denied_right = current.copied().unwrap_or(NO_MATCH);

        let edges: Option<Arc<EdgeTable>> = registry.get(LEFT_OUT_EDGES);
        let costs: Option<Arc<EdgeTable>> = registry.get(LEFT_OUT_COSTS);
        let (Some(edges), Some(costs)) = (edges, costs) else {
            return true;
        };

        let mut v = edges.get(&left).await.map(|e| e.0).unwrap_or_default();
        let mut v2 = costs.get(&left).await.map(|e| e.0).unwrap_or_default();

        if let Some(idx) = v.iter().position(|&r| r == denied_right) {
            v.remove(idx);
            if idx < v2.len() {
                v2.remove(idx);
            }
        }

        let _ = edges.enqueue_update(left, Repl(v.clone())).await;
        let _ = costs.enqueue_update(left, Repl(v2.clone())).await;

        if v.is_empty() {
            return true;
        }

        let next = if self.edge_costs {
            v.iter()
                .zip(v2.iter())
                .min_by_key(|(_, cost)| **cost)
                .map(|(right, _)| *right)
                .unwrap_or(v[0])
        } else {
            v[rand::thread_rng().gen_range(0..v.len())]
        };

        if let Some(right_matches) = registry.get::<i64, i64>(RIGHT_MATCHES) {
            let _ = right_matches.enqueue_update(next, left).await;
        }
        *proposed = next;
        true
    }
}

/// `BPMTKernel`: `InitTables`/`PopulateLeft`/`LeftBPMT`/`RightBPMT`/
/// `EvalPerformance`, dispatched by method name the way the worker runtime
/// dispatches every kernel.
pub struct BpmtKernel;

impl BpmtKernel {
    pub fn factory() -> KernelFactory {
        Arc::new(|_table_id: TableId, _shard: ShardId| Arc::new(BpmtKernel) as Arc<dyn Kernel>)
    }

    async fn init_tables(&self, registry: &Registry, params: &BpmtParams) -> anyhow::Result<()> {
        let tables = Tables::lookup(registry)?;
        tables.left_matches.resize(params.left_vertices as usize).await;
        tables.right_matches.resize(params.right_vertices as usize).await;
        tables.left_edges.resize(params.left_vertices as usize).await;
        tables.left_costs.resize(params.left_vertices as usize).await;

        for i in 0..params.left_vertices as i64 {
            tables.left_matches.update(i, NO_MATCH).await?;
            tables.left_edges.update(i, Repl(Vec::new())).await?;
            tables.left_costs.update(i, Repl(Vec::new())).await?;
        }
        for i in 0..params.right_vertices as i64 {
            tables.right_matches.update(i, NO_MATCH).await?;
            tables.right_costs.update(i, MAX_COST).await?;
        }
        tables.stats.update("quiescent".to_string(), Repl("t".to_string())).await?;
        Ok(())
    }

    async fn populate_left(&self, shard: ShardId, registry: &Registry, params: &BpmtParams) -> anyhow::Result<()> {
        let tables = Tables::lookup(registry)?;
        let entries = tables.left_edges.iterate(shard).await?;
        let mut rng = rand::thread_rng();

        for (key, _) in entries {
            let mut neighbors = Vec::new();
            let mut costs = Vec::new();
            for right in 0..params.right_vertices as i64 {
                if rng.gen::<f64>() < params.edge_probability {
                    neighbors.push(right);
                    costs.push(if params.edge_costs {
                        rng.gen_range(0..MAX_COST)
                    } else {
                        MAX_COST
                    });
                }
            }
            tables.left_edges.update(key, Repl(neighbors)).await?;
            tables.left_costs.update(key, Repl(costs)).await?;
        }
        Ok(())
    }

    async fn left_bpmt(&self, shard: ShardId, registry: &Registry, params: &BpmtParams) -> anyhow::Result<()> {
        let tables = Tables::lookup(registry)?;
        let entries = tables.left_edges.iterate(shard).await?;
        let mut rng = rand::thread_rng();

        for (left, Repl(neighbors)) in entries {
            if neighbors.is_empty() {
                continue;
            }
            let current = tables.left_matches.get(&left).await.unwrap_or(NO_MATCH);
            if current != NO_MATCH {
                continue;
            }

            let right = if params.edge_costs {
                let costs = tables.left_costs.get(&left).await.map(|c| c.0).unwrap_or_default();
                neighbors
                    .iter()
                    .zip(costs.iter())
                    .min_by_key(|(_, cost)| **cost)
                    .map(|(r, _)| *r)
                    .unwrap_or(neighbors[0])
            } else {
                neighbors[rng.gen_range(0..neighbors.len())]
            };

            tables.right_matches.update(right, left).await?;
            tables.left_matches.update(left, right).await?;
        }
        Ok(())
    }

    /// `run_one`: sweeps every left vertex for conflicting right-side
    /// matches. A vertex whose right vertex already has a claimant loses
    /// its match here, which fires `MatchDenyTrigger` on `left_matches`.
    async fn right_bpmt(&self, registry: &Registry, params: &BpmtParams) -> anyhow::Result<()> {
        let tables = Tables::lookup(registry)?;
        let mut claimants = vec![0u32; params.right_vertices as usize];
        let mut quiescent = true;
        let mut overlapped = 0u32;

        for left in 0..params.left_vertices as i64 {
            let rightmatch = tables.left_matches.get(&left).await.unwrap_or(NO_MATCH);
            if rightmatch == NO_MATCH {
                continue;
            }
            let idx = rightmatch as usize;
            if idx >= claimants.len() {
                continue;
            }
            claimants[idx] += 1;
            if claimants[idx] > 1 {
                tables.left_matches.update(left, NO_MATCH).await?;
                quiescent = false;
                overlapped += 1;
            }
        }

        tracing::info!(overlapped, "right_bpmt conflict sweep");
        tables
            .stats
            .update("quiescent".to_string(), Repl(if quiescent { "t" } else { "f" }.to_string()))
            .await?;
        Ok(())
    }

    async fn eval_performance(&self, registry: &Registry, params: &BpmtParams) -> anyhow::Result<()> {
        let tables = Tables::lookup(registry)?;
        let mut left_matched = 0u32;
        let mut right_matched = 0u32;

        for right in 0..params.right_vertices as i64 {
            if tables.right_matches.get(&right).await.unwrap_or(NO_MATCH) != NO_MATCH {
                right_matched += 1;
            }
        }
        for left in 0..params.left_vertices as i64 {
            if tables.left_matches.get(&left).await.unwrap_or(NO_MATCH) != NO_MATCH {
                left_matched += 1;
            }
        }

        tracing::info!(
            left_matched,
            left_total = params.left_vertices,
            right_matched,
            right_total = params.right_vertices,
            "bipartite matching performance"
        );
        Ok(())
    }
}

#[async_trait]
impl Kernel for BpmtKernel {
    async fn invoke(&self, method: &str, shard: ShardId, registry: &Registry, parameters: &[u8]) -> anyhow::Result<()> {
        let (params, _): (BpmtParams, usize) = bincode::decode_from_slice(parameters, common::bincode_config())
            .map_err(|e| anyhow::anyhow!("decoding BpmtParams failed: {e}"))?;
        match method {
            "init_tables" => self.init_tables(registry, &params).await,
            "populate_left" => self.populate_left(shard, registry, &params).await,
            "left_bpmt" => self.left_bpmt(shard, registry, &params).await,
            "right_bpmt" => self.right_bpmt(registry, &params).await,
            "eval_performance" => self.eval_performance(registry, &params).await,
            other => Err(anyhow::anyhow!("BpmtKernel has no method {other:?}")),
        }
    }
}
