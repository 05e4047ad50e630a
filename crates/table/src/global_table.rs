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

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{OnceLock, Weak};

use async_trait::async_trait;
use common::{Epoch, Rank, ShardId, TableId};
use store::ByteStore;
use tokio::sync::Mutex;
use transport::{KvEntry, Message, Transport};

use crate::accumulator::Accumulator;
use crate::descriptor::TableDescriptor;
use crate::error::{Result, TableError};
use crate::local_shard::LocalShard;
use crate::registry::Registry;

/// Puts are chunked so no single wire message grows unbounded; mirrors the
/// original system's `kMaxNetworkChunk`-style batching in `SendUpdates`.
const MAX_BATCH_ENTRIES: usize = 1024;

struct Inner<K, V> {
    assignment: HashMap<ShardId, Rank>,
    local_shards: HashMap<ShardId, LocalShard<K, V>>,
    outbound: HashMap<ShardId, LocalShard<K, V>>,
    /// `Some(epoch)` while a checkpoint started at `epoch` is in flight;
    /// applied puts whose epoch precedes it are tee'd into the shard's
    /// delta log (spec.md §4.6).
    checkpoint_epoch: Option<Epoch>,
}

/// A handle spanning all shards of one logical table (spec.md §4.2). Owns
/// its Local Shards and outbound buffers; routes operations by shard.
pub struct GlobalTable<K, V> {
    pub descriptor: TableDescriptor<K, V>,
    rank: Rank,
    transport: std::sync::Arc<dyn Transport>,
    store: std::sync::Arc<dyn ByteStore>,
    inner: Mutex<Inner<K, V>>,
    /// Set once, after construction, by whoever owns the process-wide
    /// Registry (spec.md §9: an explicit Table Registry, not a global).
    /// `Weak` so the table and the registry that holds it don't form a
    /// reference cycle.
    router: OnceLock<Weak<Registry>>,
    /// Set by the worker runtime once a table is registered. Optional: a
    /// table built only for unit tests works fine without one.
    stats: OnceLock<std::sync::Arc<common::Stats>>,
}

impl<K, V> GlobalTable<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialOrd + std::ops::Add<Output = V> + Send + Sync + 'static,
{
    pub fn new(
        descriptor: TableDescriptor<K, V>,
        rank: Rank,
        transport: std::sync::Arc<dyn Transport>,
        store: std::sync::Arc<dyn ByteStore>,
        assignment: HashMap<ShardId, Rank>,
    ) -> Self {
        let local_shards = assignment
            .iter()
            .filter(|(_, &owner)| owner == rank)
            .map(|(&shard, _)| (shard, LocalShard::new(descriptor.table_id, shard)))
            .collect();

        Self {
            descriptor,
            rank,
            transport,
            store,
            inner: Mutex::new(Inner {
                assignment,
                local_shards,
                outbound: HashMap::new(),
                checkpoint_epoch: None,
            }),
            router: OnceLock::new(),
            stats: OnceLock::new(),
        }
    }

    pub fn attach_registry(&self, registry: &std::sync::Arc<Registry>) {
        let _ = self.router.set(std::sync::Arc::downgrade(registry));
    }

    /// Wires up the per-worker `Stats` counters so send timeouts and
    /// outbound traffic on this table are reported on the worker's
    /// liveness heartbeat (spec.md §4.4 step 4).
    pub fn attach_stats(&self, stats: std::sync::Arc<common::Stats>) {
        let _ = self.stats.set(stats);
    }

    pub fn table_id(&self) -> TableId {
        self.descriptor.table_id
    }

    pub fn num_shards(&self) -> u32 {
        self.descriptor.shard_count
    }

    pub async fn owner(&self, shard: ShardId) -> Result<Rank> {
        let inner = self.inner.lock().await;
        inner
            .assignment
            .get(&shard)
            .copied()
            .ok_or_else(|| TableError::InvariantViolation(format!("no owner for {shard}")))
    }

    pub async fn is_local_shard(&self, shard: ShardId) -> bool {
        let inner = self.inner.lock().await;
        inner.assignment.get(&shard) == Some(&self.rank)
    }

    fn shard_of(&self, key: &K) -> (Vec<u8>, ShardId) {
        let key_bytes = self.descriptor.key_codec.encode(key);
        let shard = self
            .descriptor
            .sharder
            .shard_of(&key_bytes, self.descriptor.shard_count);
        (key_bytes, shard)
    }

    /// Public variant of `shard_of` for callers that need to partition
    /// client-side work (e.g. a kernel generating its shard's share of a
    /// synthetic dataset) the same way this table would route a key.
    pub fn shard_for(&self, key: &K) -> ShardId {
        self.shard_of(key).1
    }

    /// Resolves the process-wide Registry this table was attached to, so a
    /// trigger can reach sibling tables. Falls back to a fresh, empty
    /// Registry when none was attached (e.g. a `GlobalTable` exercised on
    /// its own in a unit test) — any trigger that actually needs a sibling
    /// table will simply find it absent.
    fn registry(&self) -> std::sync::Arc<Registry> {
        self.router.get().and_then(Weak::upgrade).unwrap_or_else(Registry::new)
    }

    /// Runs the trigger dispatcher (if any trigger is registered) then
    /// accumulates the result into `local`. Shared by the local-write path
    /// in `update`, the inbound-put handler, and the local-owner branch of
    /// `send_updates`. Triggers must reach only sibling tables through
    /// `registry` (spec.md §9) — never back into `self`, which would try
    /// to re-acquire the `inner` lock already held by the caller.
    async fn fire_and_merge(&self, local: &mut LocalShard<K, V>, key: K, value: V) {
        let descriptor = &self.descriptor;
        let triggers = descriptor.triggers.read().await;
        if triggers.is_empty() {
            drop(triggers);
            local.update(key, value, &descriptor.accumulator);
            return;
        }
        let mut proposed = value.clone();
        let current = local.get(&key).cloned();
        let registry = self.registry();
        let accept = triggers.dispatch(&registry, &key, current.as_ref(), &mut proposed).await;
        drop(triggers);
        if accept {
            local.update(key, proposed, &descriptor.accumulator);
        }
    }

    /// Returns the current value for `key`. Local shards are read
    /// directly; remote shards issue a synchronous get to the owner and
    /// block for the matching reply, servicing any other table-plane
    /// messages observed in the meantime (spec.md §4.2 routing rule).
    pub async fn get(&self, key: &K) -> Result<V> {
        let (key_bytes, shard) = self.shard_of(key);
        let owner = self.owner(shard).await?;

        if owner == self.rank {
            let inner = self.inner.lock().await;
            let local = inner
                .local_shards
                .get(&shard)
                .ok_or(TableError::NotLocalShard(shard, self.descriptor.table_id))?;
            return local.get(key).cloned().ok_or(TableError::MissingKey);
        }

        self.transport
            .send(
                owner,
                Message::GetRequest {
                    table: self.descriptor.table_id,
                    shard,
                    key: key_bytes.clone(),
                },
            )
            .await
            .map_err(|e| TableError::SendFailed(owner, e))?;
        if let Some(stats) = self.stats.get() {
            stats.record_get_out();
        }

        // Messages observed while waiting that belong to some other
        // conversation are stashed locally, not dropped, and pushed back
        // onto the transport queue once our own reply arrives.
        let mut foreign = Vec::new();
        let result = loop {
            let (from, msg) = self
                .transport
                .recv()
                .await
                .map_err(|e| TableError::SendFailed(owner, e))?;

            match msg {
                Message::GetResponse {
                    table,
                    source,
                    key: resp_key,
                    value,
                } if table == self.descriptor.table_id && source == owner && resp_key == key_bytes => {
                    break match value {
                        Some(bytes) => self.descriptor.value_codec.decode(&bytes),
                        None => Err(TableError::MissingKey),
                    };
                }
                other => {
                    let consumed = match self.router.get().and_then(Weak::upgrade) {
                        Some(registry) => registry.route(from, other.clone()).await?,
                        None => false,
                    };
                    if !consumed {
                        foreign.push((from, other));
                    }
                }
            }
        };

        for (from, msg) in foreign {
            self.transport.requeue(from, msg).await;
        }

        result
    }

    /// Applies `value` to `key` via the accumulator. Local shards fire
    /// triggers immediately; remote shards are buffered (spec.md §4.2).
    pub async fn update(&self, key: K, value: V) -> Result<()> {
        let (_, shard) = self.shard_of(&key);
        let mut inner = self.inner.lock().await;

        if inner.assignment.get(&shard) == Some(&self.rank) {
            let local = inner
                .local_shards
                .entry(shard)
                .or_insert_with(|| LocalShard::new(self.descriptor.table_id, shard));
            self.fire_and_merge(local, key, value).await;
        } else {
            let buffer = inner
                .outbound
                .entry(shard)
                .or_insert_with(|| LocalShard::new(self.descriptor.table_id, shard));
            buffer.update(key, value, &self.descriptor.accumulator);
        }
        Ok(())
    }

    /// Always buffers, even for local shards, deferring the effect to the
    /// next `send_updates` drain. The escape hatch triggers use to write
    /// without reentering the dispatcher (spec.md §4.2, §4.3).
    pub async fn enqueue_update(&self, key: K, value: V) -> Result<()> {
        let (_, shard) = self.shard_of(&key);
        let mut inner = self.inner.lock().await;
        let buffer = inner
            .outbound
            .entry(shard)
            .or_insert_with(|| LocalShard::new(self.descriptor.table_id, shard));
        buffer.update(key, value, &self.descriptor.accumulator);
        Ok(())
    }

    /// Snapshots the local shard's current entries. Fails if `shard` is
    /// not owned by this rank.
    pub async fn iterate(&self, shard: ShardId) -> Result<Vec<(K, V)>> {
        let inner = self.inner.lock().await;
        if inner.assignment.get(&shard) != Some(&self.rank) {
            return Err(TableError::NotLocalShard(shard, self.descriptor.table_id));
        }
        let local = inner
            .local_shards
            .get(&shard)
            .ok_or(TableError::NotLocalShard(shard, self.descriptor.table_id))?;
        Ok(local.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Registers `trigger` at the end of this table's firing order,
    /// returning its id for later `ENABLE_TRIGGER` toggling (spec.md §4.3).
    /// Intended to be called once during kernel setup, before the table
    /// sees any updates.
    pub async fn register_trigger(&self, trigger: Box<dyn crate::trigger::Trigger<K, V>>) -> u32 {
        self.descriptor.triggers.write().await.register(trigger)
    }

    /// Master-driven: sync-broadcasts `EnableTrigger` to `peers`, then
    /// applies it locally. Toggling is only valid between tasks (spec.md
    /// §4.3), matching the driver's disable-before-setup /
    /// enable-for-the-quiescence-loop / disable-before-final-read pattern.
    pub async fn set_trigger_enabled(&self, trigger_id: u32, enabled: bool, peers: &[Rank]) -> Result<()> {
        self.transport
            .sync_broadcast(
                peers,
                Message::EnableTrigger {
                    table: self.descriptor.table_id,
                    trigger_id,
                    enabled,
                },
            )
            .await
            .map_err(|e| TableError::SendFailed(self.rank, e))?;
        self.descriptor.triggers.write().await.set_enabled(trigger_id, enabled);
        Ok(())
    }

    /// Divides `total_hint` across local shards.
    pub async fn resize(&self, total_hint: usize) {
        let per_shard = total_hint / self.descriptor.shard_count.max(1) as usize;
        let mut inner = self.inner.lock().await;
        for shard in inner.local_shards.values_mut() {
            shard.resize(per_shard);
        }
    }

    pub async fn clear_locally(&self) {
        let mut inner = self.inner.lock().await;
        for shard in inner.local_shards.values_mut() {
            shard.clear();
        }
        for shard in inner.outbound.values_mut() {
            shard.clear();
        }
    }

    /// Master-driven: sync-broadcasts `ClearTable` to `peers`, then clears
    /// its own shards. Valid only between tasks.
    pub async fn clear(&self, peers: &[Rank]) -> Result<()> {
        self.transport
            .sync_broadcast(
                peers,
                Message::ClearTable {
                    table: self.descriptor.table_id,
                },
            )
            .await
            .map_err(|e| TableError::SendFailed(self.rank, e))?;
        self.clear_locally().await;
        Ok(())
    }

    /// Swaps this table's shard contents with `other`'s in place, without
    /// any network coordination. Called on every worker after a
    /// `SwapTable` message arrives, or locally by whichever rank drives
    /// the sync-broadcast in `swap`.
    pub async fn swap_locally(&self, other: &GlobalTable<K, V>) {
        use std::cmp::Ordering;
        match self.descriptor.table_id.0.cmp(&other.descriptor.table_id.0) {
            Ordering::Less => {
                let mut a = self.inner.lock().await;
                let mut b = other.inner.lock().await;
                std::mem::swap(&mut a.local_shards, &mut b.local_shards);
                std::mem::swap(&mut a.outbound, &mut b.outbound);
            }
            Ordering::Greater => {
                let mut b = other.inner.lock().await;
                let mut a = self.inner.lock().await;
                std::mem::swap(&mut a.local_shards, &mut b.local_shards);
                std::mem::swap(&mut a.outbound, &mut b.outbound);
            }
            Ordering::Equal => {}
        }
    }

    /// Master-driven: sync-broadcasts `SwapTable` then swaps locally.
    /// Only valid between tasks (spec.md §4.2).
    pub async fn swap(&self, other: &GlobalTable<K, V>, peers: &[Rank]) -> Result<()> {
        self.transport
            .sync_broadcast(
                peers,
                Message::SwapTable {
                    table_a: self.descriptor.table_id,
                    table_b: other.descriptor.table_id,
                },
            )
            .await
            .map_err(|e| TableError::SendFailed(self.rank, e))?;
        self.swap_locally(other).await;
        Ok(())
    }

    /// Flushes every outbound buffer: local-owner buffers are applied
    /// in-process (through the same trigger path a remote apply would
    /// take); remote buffers are sent as one or more chunked put messages,
    /// the last carrying `done=true` (spec.md §4.2).
    pub async fn send_updates(&self, epoch: Epoch) -> Result<()> {
        let drained: Vec<(ShardId, Rank, Vec<(K, V)>)> = {
            let mut inner = self.inner.lock().await;
            let shards: Vec<ShardId> = inner.outbound.keys().copied().collect();
            let mut out = Vec::new();
            for shard in shards {
                let owner = match inner.assignment.get(&shard) {
                    Some(r) => *r,
                    None => continue,
                };
                if let Some(buf) = inner.outbound.get_mut(&shard) {
                    if buf.is_dirty() {
                        let entries: Vec<(K, V)> =
                            buf.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                        buf.clear();
                        out.push((shard, owner, entries));
                    }
                }
            }
            out
        };

        for (shard, owner, entries) in drained {
            if owner == self.rank {
                let mut inner = self.inner.lock().await;
                let local = inner
                    .local_shards
                    .entry(shard)
                    .or_insert_with(|| LocalShard::new(self.descriptor.table_id, shard));
                for (k, v) in entries {
                    self.fire_and_merge(local, k, v).await;
                }
            } else {
                self.send_put_batches(owner, shard, epoch, entries).await?;
            }
        }
        Ok(())
    }

    /// Sends one or more chunked put messages for a drained buffer. A
    /// `SendTimeout`/`PeerUnreachable` failure partway through is
    /// non-fatal (spec.md §7): the attempt is abandoned, the stat counter
    /// is bumped, and the caller's task proceeds rather than aborting —
    /// the entries already drained from the buffer are lost for this
    /// flush, same as any other dropped put a kernel's own convergence
    /// loop (spec.md §5) is expected to paper over by retrying the update.
    /// Any other transport error (a malformed frame, an unknown rank) is
    /// still structural and propagates.
    async fn send_put_batches(
        &self,
        owner: Rank,
        shard: ShardId,
        epoch: Epoch,
        entries: Vec<(K, V)>,
    ) -> Result<()> {
        let chunks: Vec<&[(K, V)]> = if entries.is_empty() {
            vec![&[][..]]
        } else {
            entries.chunks(MAX_BATCH_ENTRIES).collect()
        };
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let batch: Vec<KvEntry> = chunk
                .iter()
                .map(|(k, v)| KvEntry {
                    key: self.descriptor.key_codec.encode(k),
                    value: self.descriptor.value_codec.encode(v),
                })
                .collect();
            let bytes: usize = batch.iter().map(|e| e.key.len() + e.value.len()).sum();

            let msg = Message::PutRequest {
                table: self.descriptor.table_id,
                shard,
                source: self.rank,
                epoch,
                done: i == last,
                batch,
            };
            match self.transport.send(owner, msg).await {
                Ok(()) => {
                    if let Some(stats) = self.stats.get() {
                        stats.record_put_out(bytes);
                    }
                }
                Err(e @ (transport::TransportError::SendTimeout | transport::TransportError::PeerUnreachable)) => {
                    tracing::warn!(%owner, %shard, error = %e, "dropping put batch after send failure");
                    if let Some(stats) = self.stats.get() {
                        stats.record_send_timeout();
                    }
                    return Ok(());
                }
                Err(e) => return Err(TableError::SendFailed(owner, e)),
            }
        }
        Ok(())
    }

    /// Applies one inbound put batch to `shard`, teeing into the delta log
    /// first when a checkpoint at a later epoch is in flight. A malformed
    /// entry is logged and dropped (spec.md §7's `DecodeError`, non-fatal)
    /// rather than aborting the rest of the batch.
    pub async fn handle_put(&self, shard: ShardId, epoch: Epoch, batch: Vec<KvEntry>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let checkpoint_epoch = inner.checkpoint_epoch;
        let local = inner
            .local_shards
            .entry(shard)
            .or_insert_with(|| LocalShard::new(self.descriptor.table_id, shard));

        for entry in &batch {
            if let Some(ckpt_epoch) = checkpoint_epoch {
                if epoch < ckpt_epoch {
                    local.append_delta(&entry.key, &entry.value)?;
                }
            }
            let key = match self.descriptor.key_codec.decode(&entry.key) {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!(%shard, error = %e, "dropping put entry with malformed key");
                    if let Some(stats) = self.stats.get() {
                        stats.record_decode_error();
                    }
                    continue;
                }
            };
            let value = match self.descriptor.value_codec.decode(&entry.value) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(%shard, error = %e, "dropping put entry with malformed value");
                    if let Some(stats) = self.stats.get() {
                        stats.record_decode_error();
                    }
                    continue;
                }
            };
            self.fire_and_merge(local, key, value).await;
        }
        Ok(())
    }

    /// Replies to an inbound get with the local value, or a missing-key
    /// marker if the shard holds no entry (or isn't local, in which case
    /// the reply is always "missing" — callers shouldn't route gets to a
    /// non-owner, but a stale assignment must not panic the worker).
    pub async fn handle_get(&self, shard: ShardId, key_bytes: Vec<u8>, requester: Rank) -> Result<()> {
        let value_bytes = {
            let inner = self.inner.lock().await;
            match inner.local_shards.get(&shard) {
                Some(local) => match self.descriptor.key_codec.decode(&key_bytes) {
                    Ok(key) => local.get(&key).map(|v| self.descriptor.value_codec.encode(v)),
                    Err(e) => {
                        tracing::warn!(%shard, error = %e, "get request had a malformed key");
                        if let Some(stats) = self.stats.get() {
                            stats.record_decode_error();
                        }
                        None
                    }
                },
                None => None,
            }
        };

        self.transport
            .send(
                requester,
                Message::GetResponse {
                    table: self.descriptor.table_id,
                    source: self.rank,
                    key: key_bytes,
                    value: value_bytes,
                },
            )
            .await
            .map_err(|e| TableError::SendFailed(requester, e))?;
        Ok(())
    }

    /// Writes every local shard's snapshot and opens its delta log
    /// (spec.md §4.6 step 2).
    pub async fn start_checkpoint(&self, epoch: Epoch, prefix: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.checkpoint_epoch = Some(epoch);
        let shard_count = self.descriptor.shard_count;
        let ids: Vec<ShardId> = inner.local_shards.keys().copied().collect();

        for shard in ids {
            let snap_path = store::snapshot_path(prefix, shard.0, shard_count);
            let delta_path = store::delta_path(prefix, shard.0, shard_count);
            let local = inner.local_shards.get_mut(&shard).expect("just listed");
            local.serialize(
                self.store.as_ref(),
                &snap_path,
                self.descriptor.key_codec.as_ref(),
                self.descriptor.value_codec.as_ref(),
            )?;
            local.begin_delta(self.store.as_ref(), &delta_path)?;
        }
        Ok(())
    }

    /// Closes every open delta log once the epoch is fully drained
    /// (spec.md §4.6 step 4).
    pub async fn finish_checkpoint(&self, epoch: Epoch) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.checkpoint_epoch == Some(epoch) {
            inner.checkpoint_epoch = None;
        }
        for local in inner.local_shards.values_mut() {
            if local.has_open_delta() {
                local.end_delta()?;
            }
        }
        Ok(())
    }

    /// Rebuilds local shards from snapshot + delta log, replaying the
    /// delta as a replace-log regardless of the table's live accumulator
    /// (spec.md §9: the source's accumulator-merged replay double-counts
    /// non-idempotent accumulators like sum). Missing files are skipped
    /// silently — they denote epochs with no data for that shard.
    pub async fn restore(&self, prefix: &str, owned_shards: &[ShardId]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let shard_count = self.descriptor.shard_count;
        inner.local_shards.clear();

        for &shard in owned_shards {
            let mut local = LocalShard::new(self.descriptor.table_id, shard);
            let snap_path = store::snapshot_path(prefix, shard.0, shard_count);
            let delta_path = store::delta_path(prefix, shard.0, shard_count);

            if self.store.exists(&snap_path) {
                let reader = self.store.open_read(&snap_path)?;
                local.apply_updates(
                    reader,
                    self.descriptor.key_codec.as_ref(),
                    self.descriptor.value_codec.as_ref(),
                    &Accumulator::Replace,
                )?;
            }
            if self.store.exists(&delta_path) {
                let reader = self.store.open_read(&delta_path)?;
                local.apply_updates(
                    reader,
                    self.descriptor.key_codec.as_ref(),
                    self.descriptor.value_codec.as_ref(),
                    &Accumulator::Replace,
                )?;
            }
            inner.local_shards.insert(shard, local);
        }
        Ok(())
    }
}

/// Type-erased entry point the Registry dispatches inbound table-plane
/// messages through, without needing to know a table's `(K, V)` (spec.md
/// §9's type-erased transport boundary — bytes become `K`/`V` only inside
/// the owning shard's codec calls).
#[async_trait]
pub trait TableHandle: Send + Sync {
    fn table_id(&self) -> TableId;

    /// Attempts to handle `msg`. Returns `true` if it was addressed (even
    /// partly) to this table, `false` if the caller should try elsewhere.
    async fn try_dispatch(&self, from: Rank, msg: Message) -> Result<bool>;

    /// Flushes this table's outbound buffers. The worker runtime calls
    /// this on every registered table after a task completes, without
    /// needing to know any table's concrete `(K, V)`.
    async fn flush(&self, epoch: Epoch) -> Result<()>;

    /// Swaps this table's shard contents with `other`'s, which must be the
    /// same concrete `Arc<GlobalTable<K, V>>` this handle wraps. Returns
    /// `false` without swapping if `other` is a different `(K, V)` —
    /// callers treat that as `SwapTable` naming two incompatible tables.
    /// This is how the Registry performs a swap without itself knowing
    /// either table's concrete types (spec.md §9).
    async fn swap_with(&self, other: std::sync::Arc<dyn std::any::Any + Send + Sync>) -> Result<bool>;
}

#[async_trait]
impl<K, V> TableHandle for GlobalTable<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialOrd + std::ops::Add<Output = V> + Send + Sync + 'static,
{
    fn table_id(&self) -> TableId {
        self.descriptor.table_id
    }

    async fn flush(&self, epoch: Epoch) -> Result<()> {
        self.send_updates(epoch).await
    }

    async fn swap_with(&self, other: std::sync::Arc<dyn std::any::Any + Send + Sync>) -> Result<bool> {
        match other.downcast::<GlobalTable<K, V>>() {
            Ok(other) => {
                self.swap_locally(other.as_ref()).await;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn try_dispatch(&self, from: Rank, msg: Message) -> Result<bool> {
        match msg {
            Message::PutRequest {
                table, shard, epoch, batch, ..
            } if table == self.descriptor.table_id => {
                self.handle_put(shard, epoch, batch).await?;
                Ok(true)
            }
            Message::GetRequest { table, shard, key } if table == self.descriptor.table_id => {
                self.handle_get(shard, key, from).await?;
                Ok(true)
            }
            Message::EnableTrigger {
                table,
                trigger_id,
                enabled,
            } if table == self.descriptor.table_id => {
                self.descriptor.triggers.write().await.set_enabled(trigger_id, enabled);
                Ok(true)
            }
            Message::ClearTable { table } if table == self.descriptor.table_id => {
                self.clear_locally().await;
                Ok(true)
            }
            Message::SwapTable { table_a, table_b }
                if table_a == self.descriptor.table_id || table_b == self.descriptor.table_id =>
            {
                // Registry::route intercepts SwapTable and performs the
                // swap via swap_with before any table's try_dispatch sees
                // it. This arm only claims the message for the rare caller
                // that dispatches straight to a single table's handle.
                Ok(true)
            }
            Message::StartCheckpoint {
                epoch, tables, prefix, ..
            } if tables.contains(&self.descriptor.table_id) => {
                self.start_checkpoint(epoch, &prefix).await?;
                Ok(true)
            }
            Message::FinishCheckpoint { epoch } => {
                self.finish_checkpoint(epoch).await?;
                Ok(true)
            }
            Message::Restore { tables, prefix, .. } if tables.contains(&self.descriptor.table_id) => {
                let owned: Vec<ShardId> = {
                    let inner = self.inner.lock().await;
                    inner
                        .assignment
                        .iter()
                        .filter(|(_, r)| **r == self.rank)
                        .map(|(s, _)| *s)
                        .collect()
                };
                self.restore(&prefix, &owned).await?;
                Ok(true)
            }
            Message::ShardAssignment { assignment } => {
                let relevant: Vec<(ShardId, Rank)> = assignment
                    .into_iter()
                    .filter(|(t, _, _)| *t == self.descriptor.table_id)
                    .map(|(_, s, r)| (s, r))
                    .collect();
                if relevant.is_empty() {
                    Ok(false)
                } else {
                    let mut inner = self.inner.lock().await;
                    for (shard, rank) in relevant {
                        inner.assignment.insert(shard, rank);
                    }
                    Ok(true)
                }
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;
    use crate::sharder::Sharder;
    use crate::trigger::Trigger;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use store::LocalFileStore;
    use transport::TcpTransport;

    fn temp_store(name: &str) -> Arc<LocalFileStore> {
        Arc::new(LocalFileStore::new(std::env::temp_dir().join(format!("global-table-test-{name}"))).unwrap())
    }

    fn sum_table(rank: Rank, transport: Arc<TcpTransport>, store: Arc<LocalFileStore>, assignment: HashMap<ShardId, Rank>) -> GlobalTable<i64, i64> {
        GlobalTable::new(
            TableDescriptor::new(
                TableId(1),
                1,
                Arc::new(BincodeCodec),
                Arc::new(BincodeCodec),
                Sharder::Modulo,
                Accumulator::Sum,
            ),
            rank,
            transport,
            store,
            assignment,
        )
    }

    #[tokio::test]
    async fn local_update_routes_through_accumulator() {
        let transport = TcpTransport::bind(Rank(0), vec!["127.0.0.1:28710".parse().unwrap()])
            .await
            .unwrap();
        let table = sum_table(Rank(0), transport, temp_store("local-sum"), HashMap::from([(ShardId(0), Rank(0))]));

        table.update(7, 1).await.unwrap();
        table.update(7, 1).await.unwrap();
        table.update(7, 1).await.unwrap();

        assert_eq!(table.get(&7).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn get_on_absent_key_is_missing() {
        let transport = TcpTransport::bind(Rank(0), vec!["127.0.0.1:28711".parse().unwrap()])
            .await
            .unwrap();
        let table = sum_table(Rank(0), transport, temp_store("missing-key"), HashMap::from([(ShardId(0), Rank(0))]));

        let err = table.get(&42).await.unwrap_err();
        assert!(matches!(err, TableError::MissingKey));
    }

    #[tokio::test]
    async fn iterate_on_non_local_shard_fails() {
        let transport = TcpTransport::bind(Rank(0), vec!["127.0.0.1:28712".parse().unwrap()])
            .await
            .unwrap();
        let table = sum_table(Rank(0), transport, temp_store("not-local"), HashMap::from([(ShardId(0), Rank(1))]));

        let err = table.iterate(ShardId(0)).await.unwrap_err();
        assert!(matches!(err, TableError::NotLocalShard(..)));
    }

    /// Writes to a non-local shard never touch the local shard map, only
    /// the outbound buffer — spec.md §4.2: `update` never blocks on the
    /// network and must not mutate anything this rank doesn't own.
    #[tokio::test]
    async fn update_on_remote_shard_only_buffers() {
        let transport = TcpTransport::bind(Rank(0), vec!["127.0.0.1:28713".parse().unwrap()])
            .await
            .unwrap();
        let table = sum_table(Rank(0), transport, temp_store("buffer-only"), HashMap::from([(ShardId(0), Rank(1))]));

        table.update(7, 100).await.unwrap();
        assert!(table.iterate(ShardId(0)).await.is_err(), "shard 0 is not local to rank 0");
    }

    struct Veto;
    #[async_trait]
    impl Trigger<i64, i64> for Veto {
        async fn fire(&self, _registry: &Registry, _key: &i64, _current: Option<&i64>, _proposed: &mut i64) -> bool {
            false
        }
    }

    struct DoubleIt;
    #[async_trait]
    impl Trigger<i64, i64> for DoubleIt {
        async fn fire(&self, _registry: &Registry, _key: &i64, _current: Option<&i64>, proposed: &mut i64) -> bool {
            *proposed *= 2;
            true
        }
    }

    /// spec.md §8 property 3: a write rejected by any trigger leaves the
    /// shard's value unchanged.
    #[tokio::test]
    async fn vetoed_write_leaves_value_unchanged() {
        let transport = TcpTransport::bind(Rank(0), vec!["127.0.0.1:28714".parse().unwrap()])
            .await
            .unwrap();
        let table = sum_table(Rank(0), transport, temp_store("veto"), HashMap::from([(ShardId(0), Rank(0))]));
        table.register_trigger(Box::new(Veto)).await;

        table.update(1, 5).await.unwrap();
        assert!(table.get(&1).await.is_err(), "vetoed write must never land");
    }

    #[tokio::test]
    async fn trigger_can_mutate_the_proposed_value() {
        let transport = TcpTransport::bind(Rank(0), vec!["127.0.0.1:28715".parse().unwrap()])
            .await
            .unwrap();
        let table = sum_table(Rank(0), transport, temp_store("mutate"), HashMap::from([(ShardId(0), Rank(0))]));
        table.register_trigger(Box::new(DoubleIt)).await;

        table.update(1, 5).await.unwrap();
        assert_eq!(table.get(&1).await.unwrap(), 10);
    }

    /// spec.md §4.2/§4.3: `enqueue_update` always buffers, even for a local
    /// shard, so a trigger can write without reentering the dispatcher —
    /// the effect only lands once `send_updates` drains the buffer.
    #[tokio::test]
    async fn enqueue_update_defers_to_next_drain() {
        let transport = TcpTransport::bind(Rank(0), vec!["127.0.0.1:28716".parse().unwrap()])
            .await
            .unwrap();
        let table = sum_table(Rank(0), transport, temp_store("enqueue"), HashMap::from([(ShardId(0), Rank(0))]));

        table.enqueue_update(1, 5).await.unwrap();
        assert!(table.get(&1).await.is_err(), "enqueued write has not drained yet");

        table.send_updates(Epoch::default()).await.unwrap();
        assert_eq!(table.get(&1).await.unwrap(), 5);
    }

    /// spec.md §8 property 1 (routing) and §4.2 (remote get blocks for the
    /// owner's reply): a key sharded onto a non-local shard is readable
    /// from the owning rank after a buffered write drains.
    #[tokio::test]
    async fn remote_get_routes_to_the_owning_rank() {
        let addrs: Vec<SocketAddr> = vec!["127.0.0.1:28717".parse().unwrap(), "127.0.0.1:28718".parse().unwrap()];
        let t0 = TcpTransport::bind(Rank(0), addrs.clone()).await.unwrap();
        let t1 = TcpTransport::bind(Rank(1), addrs).await.unwrap();

        let assignment = HashMap::from([(ShardId(0), Rank(1))]);
        let table0 = Arc::new(sum_table(Rank(0), t0, temp_store("remote-get-0"), assignment.clone()));
        let table1 = Arc::new(sum_table(Rank(1), t1.clone(), temp_store("remote-get-1"), assignment));

        let owner_task = {
            let table1 = table1.clone();
            let t1 = t1.clone();
            tokio::spawn(async move {
                for _ in 0..2 {
                    let (from, msg) = t1.recv().await.unwrap();
                    table1.try_dispatch(from, msg).await.unwrap();
                }
            })
        };

        table0.update(7, 42).await.unwrap();
        table0.send_updates(Epoch::default()).await.unwrap();

        assert_eq!(table0.get(&7).await.unwrap(), 42);
        owner_task.await.unwrap();
    }
}
