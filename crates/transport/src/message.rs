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

use common::{Epoch, Rank, ShardId, TableId};

/// One key/value pair inside a put batch. Keys and values cross the wire as
/// opaque bytes — only the owning shard's codec knows how to turn them back
/// into `K`/`V` (spec.md §9: type-erased transport boundary).
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct KvEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// The wire message kinds from spec.md §6. Every variant here is one
/// "kind" in the spec's message table; `Transport::send`/`recv` move whole
/// `Message` values so the kind and payload can never disagree.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum Message {
    PutRequest {
        table: TableId,
        shard: ShardId,
        source: Rank,
        epoch: Epoch,
        done: bool,
        batch: Vec<KvEntry>,
    },
    GetRequest {
        table: TableId,
        shard: ShardId,
        key: Vec<u8>,
    },
    GetResponse {
        table: TableId,
        source: Rank,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    },
    ShardAssignment {
        assignment: Vec<(TableId, ShardId, Rank)>,
    },
    RunKernel {
        kernel: String,
        method: String,
        table: TableId,
        shard: ShardId,
        epoch: Epoch,
        parameters: Vec<u8>,
    },
    KernelDone {
        table: TableId,
        shard: ShardId,
        kernel: String,
        method: String,
        epoch: Epoch,
    },
    EnableTrigger {
        table: TableId,
        trigger_id: u32,
        enabled: bool,
    },
    StartCheckpoint {
        epoch: Epoch,
        tables: Vec<TableId>,
        prefix: String,
        parameters: Vec<u8>,
    },
    FinishCheckpoint {
        epoch: Epoch,
    },
    Restore {
        epoch: Epoch,
        tables: Vec<TableId>,
        prefix: String,
    },
    SwapTable {
        table_a: TableId,
        table_b: TableId,
    },
    ClearTable {
        table: TableId,
    },
    WorkerShutdown,
    Barrier {
        token: u64,
    },
    /// Acknowledges a sync-broadcast message. `sync_broadcast` only ever
    /// has one round outstanding at a time (the master loop is
    /// synchronous), so acks need not echo back a token.
    Ack,
}

impl Message {
    /// Whether this variant is one `sync_broadcast` blocks on: every rank
    /// it was sent to must reply `Ack` before the broadcaster proceeds.
    /// `Barrier` is handled separately by the worker loop (its ack is the
    /// rendezvous itself, not a side effect of table dispatch) but is
    /// listed here too since it shares the same contract from the
    /// transport's point of view.
    pub fn needs_ack(&self) -> bool {
        matches!(
            self,
            Message::ShardAssignment { .. }
                | Message::StartCheckpoint { .. }
                | Message::FinishCheckpoint { .. }
                | Message::Restore { .. }
                | Message::SwapTable { .. }
                | Message::ClearTable { .. }
                | Message::EnableTrigger { .. }
                | Message::Barrier { .. }
        )
    }

    /// A short, stable name for the variant — used for logging and for
    /// matching replies during `sync_broadcast` without a `Discriminant`
    /// dance at every call site.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::PutRequest { .. } => "PUT_REQUEST",
            Message::GetRequest { .. } => "GET_REQUEST",
            Message::GetResponse { .. } => "GET_RESPONSE",
            Message::ShardAssignment { .. } => "SHARD_ASSIGNMENT",
            Message::RunKernel { .. } => "RUN_KERNEL",
            Message::KernelDone { .. } => "KERNEL_DONE",
            Message::EnableTrigger { .. } => "ENABLE_TRIGGER",
            Message::StartCheckpoint { .. } => "START_CHECKPOINT",
            Message::FinishCheckpoint { .. } => "FINISH_CHECKPOINT",
            Message::Restore { .. } => "RESTORE",
            Message::SwapTable { .. } => "SWAP_TABLE",
            Message::ClearTable { .. } => "CLEAR_TABLE",
            Message::WorkerShutdown => "WORKER_SHUTDOWN",
            Message::Barrier { .. } => "BARRIER",
            Message::Ack => "ACK",
        }
    }
}
