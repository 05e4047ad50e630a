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

use bincode::{Decode, Encode};

use crate::error::{Result, TableError};

/// Encodes/decodes one value type to/from the bytes that cross the wire
/// and land in checkpoint files. Spec.md §9: the Global Table is
/// polymorphic over `(K, V)` capability-wise rather than erasing types
/// through raw pointers; `Codec` is that capability.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// The only codec the framework ships: a blanket `bincode` implementation,
/// matching `sonic::Connection`'s wire format so a table's checkpoint
/// files can, in principle, be replayed through the same framing the
/// transport uses.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<T: Encode + Decode + Send + Sync> Codec<T> for BincodeCodec {
    fn encode(&self, value: &T) -> Vec<u8> {
        bincode::encode_to_vec(value, common::bincode_config())
            .expect("encoding to an in-memory buffer cannot fail")
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, common::bincode_config())
            .map(|(value, _)| value)
            .map_err(|e| TableError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bincode() {
        let codec = BincodeCodec;
        let bytes = Codec::<u64>::encode(&codec, &42u64);
        let decoded: u64 = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, 42);
    }

    #[test]
    fn decode_error_on_garbage() {
        let codec = BincodeCodec;
        let result: Result<u64> = codec.decode(&[0xff, 0xff]);
        assert!(result.is_err());
    }
}
