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

use std::sync::Arc;

use common::TableId;
use tokio::sync::RwLock;

use crate::accumulator::Accumulator;
use crate::codec::Codec;
use crate::sharder::Sharder;
use crate::trigger::TriggerDispatcher;

/// Immutable-after-registration per-table configuration (spec.md §3).
/// Every worker in the job must construct an identical descriptor for a
/// given `table_id`; nothing here is negotiated over the wire.
pub struct TableDescriptor<K, V> {
    pub table_id: TableId,
    pub shard_count: u32,
    pub key_codec: Arc<dyn Codec<K>>,
    pub value_codec: Arc<dyn Codec<V>>,
    pub sharder: Sharder,
    pub accumulator: Accumulator<V>,
    /// The one field that *is* mutated after registration: trigger
    /// enable/disable is a master-driven toggle between tasks (spec.md
    /// §4.3), guarded so a worker's inbound-message handler and kernel
    /// code can both reach it from the single cooperative loop.
    pub triggers: RwLock<TriggerDispatcher<K, V>>,
}

impl<K, V> TableDescriptor<K, V> {
    pub fn new(
        table_id: TableId,
        shard_count: u32,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        sharder: Sharder,
        accumulator: Accumulator<V>,
    ) -> Self {
        Self {
            table_id,
            shard_count,
            key_codec,
            value_codec,
            sharder,
            accumulator,
            triggers: RwLock::new(TriggerDispatcher::new()),
        }
    }
}
