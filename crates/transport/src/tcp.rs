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

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::conn::{read_message, write_message};
use crate::error::{Result, TransportError};
use crate::message::Message;
use common::{ClusterConfig, Rank};

/// A TCP-backed `Transport`. Every rank listens on `addrs[rank]` and lazily
/// opens one outbound connection per peer it talks to, mirroring
/// `sonic::ConnectionPool` but specialized to a single long-lived
/// connection per peer rather than a pool (the fleet topology is static
/// for the lifetime of a job, per spec.md §1 non-goals).
pub struct TcpTransport {
    rank: Rank,
    addrs: Vec<SocketAddr>,
    outbound: Vec<Mutex<Option<TcpStream>>>,
    inbound_tx: mpsc::UnboundedSender<(Rank, Message)>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<(Rank, Message)>>,
    /// Messages pulled out of the inbound stream by `sync_broadcast`
    /// because they weren't the ack it was waiting for; returned to callers
    /// of `recv`/`try_recv` before anything newer.
    pending: Mutex<VecDeque<(Rank, Message)>>,
}

impl TcpTransport {
    /// Binds this rank's listener and spawns the accept loop. `addrs` must
    /// list every rank's address, indexed by rank number.
    pub async fn bind(rank: Rank, addrs: Vec<SocketAddr>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addrs[rank.0 as usize]).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let outbound = addrs.iter().map(|_| Mutex::new(None)).collect();

        let this = Arc::new(Self {
            rank,
            addrs,
            outbound,
            inbound_tx: tx,
            inbound_rx: Mutex::new(rx),
            pending: Mutex::new(VecDeque::new()),
        });

        let accept_tx = this.inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(?peer, "accepted connection");
                        let tx = accept_tx.clone();
                        tokio::spawn(Self::read_loop(stream, tx));
                    }
                    Err(e) => {
                        tracing::error!("accept failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(this)
    }

    /// Same as [`Self::bind`], reading the rank table from a
    /// [`ClusterConfig`] instead of a bare address vector — the shape a
    /// launched process actually has after parsing its cluster file.
    pub async fn bind_cluster(rank: Rank, config: &ClusterConfig) -> Result<Arc<Self>> {
        Self::bind(rank, config.addrs().to_vec()).await
    }

    async fn read_loop(mut stream: TcpStream, tx: mpsc::UnboundedSender<(Rank, Message)>) {
        // Handshake: the connecting side writes its rank as the first four
        // bytes before switching to framed messages.
        let mut rank_buf = [0u8; 4];
        use tokio::io::AsyncReadExt;
        if stream.read_exact(&mut rank_buf).await.is_err() {
            return;
        }
        let peer = Rank(u32::from_le_bytes(rank_buf));

        loop {
            match read_message(&mut stream).await {
                Ok(msg) => {
                    if tx.send((peer, msg)).is_err() {
                        return;
                    }
                }
                Err(TransportError::Closed) => return,
                Err(e) => {
                    tracing::warn!(%peer, "read loop error: {e}");
                    return;
                }
            }
        }
    }

    async fn connection(&self, to: Rank) -> Result<tokio::sync::MutexGuard<'_, Option<TcpStream>>> {
        let slot = self
            .outbound
            .get(to.0 as usize)
            .ok_or(TransportError::UnknownRank(to))?;
        let mut guard = slot.lock().await;

        if guard.is_none() {
            let addr = *self
                .addrs
                .get(to.0 as usize)
                .ok_or(TransportError::UnknownRank(to))?;
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|_| TransportError::PeerUnreachable)?;
            stream.set_nodelay(true).ok();

            use tokio::io::AsyncWriteExt;
            stream.write_all(&self.rank.0.to_le_bytes()).await?;

            *guard = Some(stream);
        }

        Ok(guard)
    }
}

#[async_trait::async_trait]
impl crate::Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.addrs.len()
    }

    async fn send(&self, to: Rank, msg: Message) -> Result<()> {
        let deadline = tokio::time::Duration::from_secs(5);
        let mut guard = self.connection(to).await?;

        let result = tokio::time::timeout(deadline, async {
            let stream = guard.as_mut().expect("connection just established");
            write_message(stream, &msg).await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                *guard = None; // drop the bad connection, reconnect next time
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(TransportError::SendTimeout)
            }
        }
    }

    async fn recv(&self) -> Result<(Rank, Message)> {
        if let Some(item) = self.pending.lock().await.pop_front() {
            return Ok(item);
        }
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    fn try_recv(&self) -> Option<(Rank, Message)> {
        if let Ok(mut pending) = self.pending.try_lock() {
            if let Some(item) = pending.pop_front() {
                return Some(item);
            }
        }
        self.inbound_rx.try_lock().ok()?.try_recv().ok()
    }

    async fn sync_broadcast(&self, peers: &[Rank], msg: Message) -> Result<()> {
        for &peer in peers {
            self.send(peer, msg.clone()).await?;
        }

        // Read straight from `inbound_rx`, not through `recv()`: `recv()`
        // drains `pending` first, and a message this same wait stashed
        // would be popped right back out before any fresh ack from
        // `inbound_rx` is ever looked at, spinning forever. Non-ack
        // messages go into a local buffer instead and are only merged into
        // `pending` once every ack is in.
        let mut acked: HashSet<Rank> = HashSet::new();
        let mut foreign = Vec::new();
        while acked.len() < peers.len() {
            let (from, m) = self
                .inbound_rx
                .lock()
                .await
                .recv()
                .await
                .ok_or(TransportError::Closed)?;
            if matches!(m, Message::Ack) && peers.contains(&from) {
                acked.insert(from);
            } else {
                foreign.push((from, m));
            }
        }

        let mut pending = self.pending.lock().await;
        for item in foreign {
            pending.push_back(item);
        }

        Ok(())
    }

    async fn requeue(&self, from: Rank, msg: Message) {
        self.pending.lock().await.push_back((from, msg));
    }
}
