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

use common::TableId;

/// Which shards a master-driven run touches.
#[derive(Debug, Clone)]
pub enum RunScope {
    /// `run_all`: every shard of the locality table.
    All,
    /// `run_one`: a single, arbitrary shard.
    One,
    /// `run_range`: a caller-chosen subset.
    Range(Vec<common::ShardId>),
}

/// Whether (and how) a run's writes are checkpointed.
#[derive(Debug, Clone, Default)]
pub enum CheckpointPolicy {
    #[default]
    None,
    /// Checkpoint `tables` under `prefix` once the run completes.
    AfterRun { prefix: String },
}

/// User-supplied description of one kernel invocation round (spec.md §3).
/// Expands to one task per shard of `locality_table_id` (or one task for
/// `RunScope::One`).
#[derive(Debug, Clone)]
pub struct RunDescriptor {
    pub kernel_name: String,
    pub method_name: String,
    pub locality_table_id: TableId,
    pub scope: RunScope,
    /// Wait for global write quiescence after every dispatched task
    /// completes (spec.md §4.5 step 5).
    pub barrier: bool,
    pub checkpoint_policy: CheckpointPolicy,
    pub checkpoint_tables: Vec<TableId>,
    pub parameters: Vec<u8>,
}

impl RunDescriptor {
    pub fn run_all(kernel_name: impl Into<String>, method_name: impl Into<String>, table: TableId) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            method_name: method_name.into(),
            locality_table_id: table,
            scope: RunScope::All,
            barrier: true,
            checkpoint_policy: CheckpointPolicy::None,
            checkpoint_tables: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn run_one(kernel_name: impl Into<String>, method_name: impl Into<String>, table: TableId) -> Self {
        Self {
            scope: RunScope::One,
            ..Self::run_all(kernel_name, method_name, table)
        }
    }

    pub fn run_range(
        kernel_name: impl Into<String>,
        method_name: impl Into<String>,
        table: TableId,
        shards: Vec<common::ShardId>,
    ) -> Self {
        Self {
            scope: RunScope::Range(shards),
            ..Self::run_all(kernel_name, method_name, table)
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<u8>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn without_barrier(mut self) -> Self {
        self.barrier = false;
        self
    }
}
