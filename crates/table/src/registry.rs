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

use std::any::Any;
use std::sync::{Arc, OnceLock};

use common::{Rank, TableId};
use dashmap::DashMap;
use transport::Message;

use crate::error::Result;
use crate::global_table::{GlobalTable, TableHandle};

struct Entry {
    any: Arc<dyn Any + Send + Sync>,
    handle: Arc<dyn TableHandle>,
}

/// Process-wide mapping from table id to its Global Table (spec.md §2,
/// §9). Exclusively owns every registered Global Table; workers and the
/// master hold non-owning references via table-id lookups, never a raw
/// global pointer.
#[derive(Default)]
pub struct Registry {
    tables: DashMap<TableId, Entry>,
    stats: OnceLock<Arc<common::Stats>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wires the worker's `Stats` counters into every table registered
    /// from this point on (spec.md §4.4 step 4's liveness/stats report).
    /// Call before any table is registered; a table registered earlier
    /// keeps reporting into nothing, same as an unattached table always
    /// has.
    pub fn set_stats(&self, stats: Arc<common::Stats>) {
        let _ = self.stats.set(stats);
    }

    /// Registers `table` under its own `table_id`. Also wires the table's
    /// `router` back to this registry so a blocked `GlobalTable::get` can
    /// service other tables' inbound messages reentrantly, and its
    /// `stats`, if this registry has one.
    pub fn register<K, V>(self: &Arc<Self>, table: Arc<GlobalTable<K, V>>)
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        table.attach_registry(self);
        if let Some(stats) = self.stats.get() {
            table.attach_stats(stats.clone());
        }
        let id = table.table_id();
        self.tables.insert(
            id,
            Entry {
                any: table.clone(),
                handle: table,
            },
        );
    }

    /// Looks up a previously registered table by id, downcasting back to
    /// its concrete `(K, V)`. Returns `None` if nothing is registered
    /// under `table_id` or it was registered with different types.
    pub fn get<K, V>(&self, table_id: TableId) -> Option<Arc<GlobalTable<K, V>>>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.tables
            .get(&table_id)
            .and_then(|entry| entry.any.clone().downcast::<GlobalTable<K, V>>().ok())
    }

    /// Offers `msg` to every registered table, returning `true` if any one
    /// of them claimed it. Used both by the worker runtime's main message
    /// loop and by a Global Table blocked on a remote get.
    ///
    /// `SwapTable` is special-cased here rather than in any one table's
    /// `try_dispatch`: swapping needs both tables' concrete `(K, V)`, which
    /// only the Registry can resolve (spec.md §9's type-erased transport
    /// boundary). `table_a`/`table_b` must share `(K, V)` or the swap is a
    /// no-op, treated as an `InvariantViolation`.
    pub async fn route(&self, from: Rank, msg: Message) -> Result<bool> {
        if let Message::SwapTable { table_a, table_b } = &msg {
            return self.swap(*table_a, *table_b).await;
        }

        let handles: Vec<Arc<dyn TableHandle>> =
            self.tables.iter().map(|e| e.handle.clone()).collect();

        let mut consumed = false;
        for handle in handles {
            if handle.try_dispatch(from, msg.clone()).await? {
                consumed = true;
            }
        }
        Ok(consumed)
    }

    async fn swap(&self, table_a: TableId, table_b: TableId) -> Result<bool> {
        if table_a == table_b {
            return Ok(true);
        }
        let handle_a = match self.tables.get(&table_a) {
            Some(e) => e.handle.clone(),
            None => return Ok(false),
        };
        let any_b = match self.tables.get(&table_b) {
            Some(e) => e.any.clone(),
            None => return Ok(false),
        };
        handle_a.swap_with(any_b).await
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.iter().map(|e| *e.key()).collect()
    }

    /// Flushes every registered table's outbound buffers, stamping
    /// `epoch` on whatever puts that produces. Called by the worker
    /// runtime once a task's kernel method returns (spec.md §4.4 step 3).
    pub async fn flush_all(&self, epoch: common::Epoch) -> Result<()> {
        let handles: Vec<Arc<dyn TableHandle>> =
            self.tables.iter().map(|e| e.handle.clone()).collect();
        for handle in handles {
            handle.flush(epoch).await?;
        }
        Ok(())
    }
}
