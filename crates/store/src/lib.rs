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

//! A small collection of disk-based primitives for table checkpoints —
//! "a persistent byte-stream store" in spec.md §1's collaborator list.
//! Grounded in the teacher's `file_store` crate ("a collection of simple
//! disk-based data structures") and in the original system's
//! `LocalTableCoder`/`RecordFile` (`src/kernel/local-table.cc`,
//! `src/util/file.h`): a flat file of length-prefixed `(key, value)` chunks.

mod chunked;
mod error;

pub use chunked::{ChunkReader, ChunkWriter};
pub use error::{Result, StoreError};

use std::path::{Path, PathBuf};

/// The collaborator interface spec.md §6 names: `open`, `read_chunk` /
/// `write_chunk`, `exists`.
pub trait ByteStore: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn open_write(&self, path: &Path) -> Result<ChunkWriter>;
    fn open_read(&self, path: &Path) -> Result<ChunkReader>;
    fn remove(&self, path: &Path) -> Result<()>;
}

/// Stores checkpoint files under a root directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl ByteStore for LocalFileStore {
    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }

    fn open_write(&self, path: &Path) -> Result<ChunkWriter> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        ChunkWriter::create(&full)
    }

    fn open_read(&self, path: &Path) -> Result<ChunkReader> {
        ChunkReader::open(&self.resolve(path))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        if full.exists() {
            std::fs::remove_file(full)?;
        }
        Ok(())
    }
}

/// The snapshot filename for shard `shard` of `shard_count` under `prefix`,
/// per spec.md §4.2/§6: `"{prefix}.{shard:05}-of-{count:05}"`.
pub fn snapshot_path(prefix: &str, shard: u32, shard_count: u32) -> PathBuf {
    PathBuf::from(format!("{prefix}.{shard:05}-of-{shard_count:05}"))
}

/// The delta-log sibling of a snapshot path.
pub fn delta_path(prefix: &str, shard: u32, shard_count: u32) -> PathBuf {
    let mut p = snapshot_path(prefix, shard, shard_count).into_os_string();
    p.push(".delta");
    p.into()
}

/// The manifest filename for one checkpoint epoch.
pub fn manifest_path(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}.manifest"))
}
