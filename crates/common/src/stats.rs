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

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker traffic and error counters, reported to the master on the
/// periodic liveness heartbeat.
#[derive(Debug, Default)]
pub struct Stats {
    pub puts_in: AtomicU64,
    pub puts_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub gets_in: AtomicU64,
    pub gets_out: AtomicU64,
    pub send_timeouts: AtomicU64,
    pub decode_errors: AtomicU64,
}

impl Stats {
    pub fn record_put_in(&self, bytes: usize) {
        self.puts_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_put_out(&self, bytes: usize) {
        self.puts_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_get_in(&self) {
        self.gets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_out(&self) {
        self.gets_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_timeout(&self) {
        self.send_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            puts_in: self.puts_in.load(Ordering::Relaxed),
            puts_out: self.puts_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            gets_in: self.gets_in.load(Ordering::Relaxed),
            gets_out: self.gets_out.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct StatsSnapshot {
    pub puts_in: u64,
    pub puts_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub gets_in: u64,
    pub gets_out: u64,
    pub send_timeouts: u64,
    pub decode_errors: u64,
}
