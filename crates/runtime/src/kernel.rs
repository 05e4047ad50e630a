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

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{ShardId, TableId};
use table::Registry;

/// User kernel code, dispatched by method name (spec.md §4.4: the worker
/// "instantiates/reuses a kernel object, invokes the method"). Kernels
/// reach tables exclusively through the `Registry` handle they're given,
/// never a global (spec.md §9).
#[async_trait]
pub trait Kernel: Send + Sync {
    async fn invoke(
        &self,
        method: &str,
        shard: ShardId,
        registry: &Registry,
        parameters: &[u8],
    ) -> anyhow::Result<()>;
}

pub type KernelFactory = Arc<dyn Fn(TableId, ShardId) -> Arc<dyn Kernel> + Send + Sync>;

/// Maps kernel names to the factory that constructs one instance per
/// `(kernel_name, table_id, shard_id)` the worker needs (spec.md §4.4).
#[derive(Clone, Default)]
pub struct KernelRegistry {
    factories: HashMap<String, KernelFactory>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: KernelFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn instantiate(&self, name: &str, table_id: TableId, shard_id: ShardId) -> Option<Arc<dyn Kernel>> {
        self.factories.get(name).map(|f| f(table_id, shard_id))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}
