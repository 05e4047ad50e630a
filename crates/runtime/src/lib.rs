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

//! Master and worker runtimes: the scheduling half of the system (spec.md
//! §4.4-§4.6). `table` owns per-shard state and the wire protocol for puts
//! and gets; this crate owns *when* a kernel method runs, on which shard,
//! and how writes are fenced into a checkpoint. Checkpoint orchestration
//! lives inside [`MasterRuntime`] rather than a separate module — the
//! master's role in a checkpoint is three `sync_broadcast` calls and a
//! manifest write, not enough machinery to earn its own file.

mod error;
mod kernel;
mod master;
mod run_descriptor;
mod task;
mod worker;

pub use error::{Result, RuntimeError};
pub use kernel::{Kernel, KernelFactory, KernelRegistry};
pub use master::MasterRuntime;
pub use run_descriptor::{CheckpointPolicy, RunDescriptor, RunScope};
pub use task::Task;
pub use worker::WorkerRuntime;
