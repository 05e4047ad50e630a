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

//! Table Descriptor & Registry, Local Shard, Global Table, Accumulator,
//! Sharder and Trigger Dispatcher (spec.md §2, components 2-5). Grounded
//! in the original system's `kernel/local-table.cc` and
//! `kernel/global-table.cc`, re-architected per spec.md §9: closed
//! accumulator/sharder tag sets instead of function pointers, an explicit
//! Registry value instead of process-wide globals, and a type-erased
//! `TableHandle` at the transport boundary instead of raw memory casts.

mod accumulator;
mod codec;
mod descriptor;
mod error;
mod global_table;
mod local_shard;
mod registry;
mod sharder;
mod trigger;

pub use accumulator::Accumulator;
pub use codec::{BincodeCodec, Codec};
pub use descriptor::TableDescriptor;
pub use error::{Result, TableError};
pub use global_table::{GlobalTable, TableHandle};
pub use local_shard::LocalShard;
pub use registry::Registry;
pub use sharder::Sharder;
pub use trigger::{Trigger, TriggerDispatcher};
