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

use common::{Epoch, ShardId, TableId};

/// One `(shard, method)` execution unit, the master's scheduling atom
/// (spec.md §3). Created by the master on dispatch, sent to the assigned
/// worker, executed, and reported back on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub table_id: TableId,
    pub shard_id: ShardId,
    pub kernel_name: String,
    pub method_name: String,
    pub epoch: Epoch,
    pub parameters: Vec<u8>,
}
