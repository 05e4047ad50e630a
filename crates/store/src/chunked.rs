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

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Result, StoreError};

/// Writes a flat stream of length-prefixed `(key, value)` byte pairs, the
/// same framing `LocalTableCoder::WriteEntry` used in the original system:
/// each chunk is a little-endian `u64` length followed by that many bytes.
pub struct ChunkWriter {
    inner: BufWriter<File>,
}

impl ChunkWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            inner: BufWriter::new(file),
        })
    }

    fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(&(bytes.len() as u64).to_le_bytes())?;
        self.inner.write_all(bytes)?;
        Ok(())
    }

    /// Appends one `(key, value)` entry.
    pub fn write_entry(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_chunk(key)?;
        self.write_chunk(value)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        let _ = self.inner.flush();
    }
}

/// Reads back what `ChunkWriter` wrote, one entry at a time.
pub struct ChunkReader {
    inner: BufReader<File>,
}

impl ChunkReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            inner: BufReader::new(file),
        })
    }

    fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 8];
        match self.inner.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u64::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .map_err(|_| StoreError::Corrupt("truncated chunk body".into()))?;
        Ok(Some(buf))
    }

    /// Reads the next `(key, value)` entry, or `None` at end of stream.
    pub fn read_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let key = match self.read_chunk()? {
            Some(k) => k,
            None => return Ok(None),
        };
        let value = self
            .read_chunk()?
            .ok_or_else(|| StoreError::Corrupt("key without matching value".into()))?;
        Ok(Some((key, value)))
    }
}

impl Iterator for ChunkReader {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_entry().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_entries() {
        let dir = std::env::temp_dir().join(format!("store-test-{}", uuid_like()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("shard.00000-of-00001");

        {
            let mut w = ChunkWriter::create(&path).unwrap();
            w.write_entry(b"a", b"1").unwrap();
            w.write_entry(b"bb", b"22").unwrap();
            w.flush().unwrap();
        }

        let r = ChunkReader::open(&path).unwrap();
        let entries: Vec<_> = r.map(|e| e.unwrap()).collect();
        assert_eq!(
            entries,
            vec![(b"a".to_vec(), b"1".to_vec()), (b"bb".to_vec(), b"22".to_vec())]
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = std::env::temp_dir().join(format!("store-test-missing-{}", uuid_like()));
        let path = dir.join("nope");
        assert!(ChunkReader::open(&path).is_err());
    }

    fn uuid_like() -> u128 {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        (nanos << 16) | (std::process::id() as u128)
    }
}
