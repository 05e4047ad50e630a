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

use common::{Rank, ShardId, TableId};

/// The error taxonomy from spec.md §7, as it applies to table operations.
/// `MissingKey` and `DecodeError` are non-fatal and surface as values;
/// `NotLocalShard` and `InvariantViolation` are structural and abort the
/// task that triggered them (see `runtime::RuntimeError` for that
/// escalation).
#[derive(thiserror::Error, Debug)]
pub enum TableError {
    #[error("key not found")]
    MissingKey,

    #[error("shard {0} of table {1} is not owned by this rank")]
    NotLocalShard(ShardId, TableId),

    #[error("unknown table {0}")]
    UnknownTable(TableId),

    #[error("malformed key/value bytes: {0}")]
    Decode(String),

    #[error("send to rank {0} timed out or failed: {1}")]
    SendFailed(Rank, #[source] transport::TransportError),

    #[error("checkpoint I/O error: {0}")]
    CheckpointIo(#[from] store::StoreError),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, TableError>;
