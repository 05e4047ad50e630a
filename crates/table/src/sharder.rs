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

use std::sync::Arc;

use common::ShardId;

/// The closed family of sharding functions, the other half of spec.md §9's
/// capability-set redesign. Operates on already-encoded key bytes so it
/// never needs to know `K`.
#[derive(Clone)]
pub enum Sharder {
    /// `fnv1a(key_bytes) % shard_count`.
    Modulo,
    /// Same hash, kept as a distinct tag for callers that want to document
    /// "this table is sharded by string identity" even though the
    /// implementation coincides with `Modulo` today.
    StringHash,
    Custom(Arc<dyn Fn(&[u8], u32) -> u32 + Send + Sync>),
}

impl Sharder {
    pub fn shard_of(&self, key_bytes: &[u8], shard_count: u32) -> ShardId {
        assert!(shard_count > 0, "shard_count must be positive");
        match self {
            Sharder::Modulo => ShardId((le_bytes_mod(key_bytes, shard_count as u64)) as u32),
            Sharder::StringHash => ShardId((fnv1a(key_bytes) % shard_count as u64) as u32),
            Sharder::Custom(f) => ShardId(f(key_bytes, shard_count)),
        }
    }
}

/// Folds `bytes` as a little-endian arbitrary-width unsigned integer and
/// reduces it mod `modulus`, processing most-significant byte first so the
/// result is the integer's true residue rather than a hash of its bytes.
/// For the small integer keys `bincode`'s varint scheme encodes as a
/// single byte (spec.md §8 scenario S2 relies on `get(k=7)` routing to
/// `7 % shard_count` exactly), this is literally `key % shard_count`.
fn le_bytes_mod(bytes: &[u8], modulus: u64) -> u64 {
    let mut acc: u64 = 0;
    for &b in bytes.iter().rev() {
        acc = (acc % modulus) * 256 % modulus;
        acc = (acc + b as u64) % modulus;
    }
    acc
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

impl std::fmt::Debug for Sharder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Sharder::Modulo => "Modulo",
            Sharder::StringHash => "StringHash",
            Sharder::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modulo_is_stable_and_in_range() {
        let sharder = Sharder::Modulo;
        for k in 0u32..50 {
            let shard = sharder.shard_of(&k.to_le_bytes(), 4);
            assert!(shard.0 < 4);
            assert_eq!(shard, sharder.shard_of(&k.to_le_bytes(), 4));
        }
    }

    #[test]
    fn key_seven_mod_four_is_shard_three() {
        let sharder = Sharder::Modulo;
        let shard = sharder.shard_of(&7u32.to_le_bytes(), 4);
        assert_eq!(shard, ShardId(3));
    }

    #[test]
    fn modulo_matches_literal_arithmetic_for_small_keys() {
        let sharder = Sharder::Modulo;
        for k in 0u32..64 {
            assert_eq!(sharder.shard_of(&k.to_le_bytes(), 4), ShardId(k % 4));
        }
    }

    #[test]
    fn custom_sharder() {
        let sharder = Sharder::Custom(Arc::new(|bytes, count| bytes[0] as u32 % count));
        assert_eq!(sharder.shard_of(&[5], 3), ShardId(2));
    }
}
