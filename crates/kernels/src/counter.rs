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

//! A minimal `Accumulator::Sum` kernel: every shard adds its contribution
//! into a shared set of buckets, exercising buffered remote writes merged
//! by the accumulator rather than overwritten, and a plain remote `get`.
//! Grounded in the `Accumulator<double>::min` wiring from
//! `examples/test-shortest-path.cc`, generalized to the `Sum` tag spec.md
//! §9 carries alongside `Min`/`Max`/`Replace`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Rank, ShardId, TableId};
use runtime::{Kernel, KernelFactory};
use store::ByteStore;
use table::{Accumulator, BincodeCodec, GlobalTable, Registry, Sharder, TableDescriptor};
use transport::Transport;

pub const COUNTERS: TableId = TableId(40);

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct AccumulateParams {
    /// `(bucket, delta)` pairs to add into `COUNTERS`. Buckets are usually
    /// shared across shards on purpose, so the same key accumulates
    /// concurrent contributions from every shard that names it.
    pub deltas: Vec<(u32, i64)>,
}

pub async fn build_counters_table(
    rank: Rank,
    shard_count: u32,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ByteStore>,
    registry: &Arc<Registry>,
) -> Arc<GlobalTable<u32, i64>> {
    let counters = Arc::new(GlobalTable::new(
        TableDescriptor::new(
            COUNTERS,
            shard_count,
            Arc::new(BincodeCodec),
            Arc::new(BincodeCodec),
            Sharder::Modulo,
            Accumulator::Sum,
        ),
        rank,
        transport,
        store,
        HashMap::new(),
    ));
    registry.register(counters.clone());
    counters
}

pub struct CounterKernel;

impl CounterKernel {
    pub fn factory() -> KernelFactory {
        Arc::new(|_table_id: TableId, _shard: ShardId| Arc::new(CounterKernel) as Arc<dyn Kernel>)
    }
}

fn lookup(registry: &Registry) -> anyhow::Result<Arc<GlobalTable<u32, i64>>> {
    registry
        .get(COUNTERS)
        .ok_or_else(|| anyhow::anyhow!("counters table was not registered on this worker"))
}

#[async_trait]
impl Kernel for CounterKernel {
    async fn invoke(&self, method: &str, _shard: ShardId, registry: &Registry, parameters: &[u8]) -> anyhow::Result<()> {
        let counters = lookup(registry)?;
        match method {
            "accumulate" => {
                let (params, _): (AccumulateParams, usize) = bincode::decode_from_slice(parameters, common::bincode_config())
                    .map_err(|e| anyhow::anyhow!("decoding AccumulateParams failed: {e}"))?;
                for (bucket, delta) in params.deltas {
                    counters.update(bucket, delta).await?;
                }
                Ok(())
            }
            "log_bucket" => {
                let (bucket, _): (u32, usize) = bincode::decode_from_slice(parameters, common::bincode_config())
                    .map_err(|e| anyhow::anyhow!("decoding bucket id failed: {e}"))?;
                let value = counters.get(&bucket).await.unwrap_or(0);
                tracing::info!(bucket, value, "counter bucket read");
                Ok(())
            }
            other => Err(anyhow::anyhow!("CounterKernel has no method {other:?}")),
        }
    }
}
