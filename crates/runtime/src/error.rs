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

use common::{Rank, TableId};

/// Errors escalated from table/transport operations plus the control-plane
/// taxonomy from spec.md §7: `InvariantViolation` is fatal to the worker
/// process; `CheckpointIoError` aborts the run.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Table(#[from] table::TableError),

    #[error(transparent)]
    Transport(#[from] transport::TransportError),

    #[error("no kernel registered under name {0:?}")]
    UnknownKernel(String),

    #[error("kernel {0:?} has no method {1:?}")]
    UnknownMethod(String, String),

    #[error("kernel method failed: {0:#}")]
    KernelFailed(#[source] anyhow::Error),

    #[error("checkpoint I/O error: {0}")]
    CheckpointIo(#[from] store::StoreError),

    #[error("unknown rank {0}")]
    UnknownRank(Rank),

    #[error("unknown table {0}")]
    UnknownTable(TableId),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
