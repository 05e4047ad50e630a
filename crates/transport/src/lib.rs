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

//! Reliable ordered point-to-point messaging between ranks (spec.md §2.1,
//! §6). Grounded in the teacher's `sonic` RPC stack
//! (`crates/core/src/distributed/sonic/mod.rs`): length-prefixed,
//! bincode-framed TCP, a lazily-established outbound connection per peer,
//! and a background accept loop feeding an inbound queue.

mod conn;
mod error;
mod message;
mod tcp;

pub use error::{Result, TransportError};
pub use message::{KvEntry, Message};
pub use tcp::TcpTransport;

use async_trait::async_trait;
use common::Rank;

/// The collaborator interface spec.md §6 assumes: send, blocking receive,
/// non-blocking poll, and a sync-broadcast primitive.
#[async_trait]
pub trait Transport: Send + Sync {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> usize;

    /// Sends `msg` to `to`. Ordered with respect to any other `send` to the
    /// same peer from this transport instance.
    async fn send(&self, to: Rank, msg: Message) -> Result<()>;

    /// Blocks until a message arrives from any peer.
    async fn recv(&self) -> Result<(Rank, Message)>;

    /// Returns immediately with `None` if nothing is queued.
    fn try_recv(&self) -> Option<(Rank, Message)>;

    /// Sends `msg` to every rank in `peers` and blocks until each has
    /// replied with `Message::Ack`. Messages received in the meantime that
    /// are not acks are preserved for the next `recv`/`try_recv`.
    async fn sync_broadcast(&self, peers: &[Rank], msg: Message) -> Result<()>;

    /// Pushes a message back onto the inbound queue so a later `recv`/
    /// `try_recv` observes it. Used by callers that pulled a message off
    /// the queue while blocked waiting for something else (e.g. a Global
    /// Table blocked on a remote get) and found it belongs to someone
    /// else's turn.
    async fn requeue(&self, from: Rank, msg: Message);
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn rank(&self) -> Rank {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    async fn send(&self, to: Rank, msg: Message) -> Result<()> {
        (**self).send(to, msg).await
    }

    async fn recv(&self) -> Result<(Rank, Message)> {
        (**self).recv().await
    }

    fn try_recv(&self) -> Option<(Rank, Message)> {
        (**self).try_recv()
    }

    async fn sync_broadcast(&self, peers: &[Rank], msg: Message) -> Result<()> {
        (**self).sync_broadcast(peers, msg).await
    }

    async fn requeue(&self, from: Rank, msg: Message) {
        (**self).requeue(from, msg).await
    }
}
