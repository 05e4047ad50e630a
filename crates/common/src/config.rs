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

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::Rank;

/// The rank table every process in a job is launched with: rank 0's address
/// is the master, the rest are workers. Mirrors the way the teacher's
/// mapreduce `Worker`/`Manager` binaries take a `SocketAddr` (a single
/// worker) or a list of peer addresses (the manager) from process
/// arguments, generalized to one shared, serializable config value both
/// sides load instead of parsing ad hoc argv.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    addrs: Vec<SocketAddr>,
}

impl ClusterConfig {
    /// Builds a config from an explicit rank-indexed address list.
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }

    /// A `world_size`-rank cluster on loopback, starting at `base_port`.
    /// Convenient for tests and single-machine demos; not how a real
    /// deployment would be configured.
    pub fn loopback(base_port: u16, world_size: u32) -> Self {
        let addrs = (0..world_size)
            .map(|i| {
                SocketAddr::from(([127, 0, 0, 1], base_port + i as u16))
            })
            .collect();
        Self { addrs }
    }

    /// Parses a config from `RANK=host:port` lines, one per rank in order,
    /// as a process would read its cluster file from disk or `stdin`.
    pub fn parse(text: &str) -> Result<Self, std::net::AddrParseError> {
        let addrs = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.parse())
            .collect::<Result<Vec<SocketAddr>, _>>()?;
        Ok(Self { addrs })
    }

    pub fn world_size(&self) -> usize {
        self.addrs.len()
    }

    pub fn addr(&self, rank: Rank) -> Option<SocketAddr> {
        self.addrs.get(rank.0 as usize).copied()
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn into_addrs(self) -> Vec<SocketAddr> {
        self.addrs
    }

    pub fn master(&self) -> Option<SocketAddr> {
        self.addr(Rank::MASTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_assigns_consecutive_ports() {
        let cfg = ClusterConfig::loopback(9000, 3);
        assert_eq!(cfg.world_size(), 3);
        assert_eq!(cfg.addr(Rank(0)).unwrap().port(), 9000);
        assert_eq!(cfg.addr(Rank(2)).unwrap().port(), 9002);
        assert!(cfg.addr(Rank(3)).is_none());
    }

    #[test]
    fn parse_skips_blank_and_comment_lines() {
        let cfg = ClusterConfig::parse(
            "# cluster file\n127.0.0.1:9000\n\n127.0.0.1:9001\n",
        )
        .unwrap();
        assert_eq!(cfg.world_size(), 2);
        assert_eq!(cfg.master(), Some("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn parse_rejects_malformed_address() {
        assert!(ClusterConfig::parse("not-an-address").is_err());
    }
}
