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

/// Transport-layer error taxonomy. `SendTimeout` and `PeerUnreachable` are
/// deliberately non-fatal (spec.md §7): callers count them and move on, the
/// application-level convergence loop is the retry mechanism.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("send to peer timed out")]
    SendTimeout,

    #[error("peer is unreachable")]
    PeerUnreachable,

    #[error("malformed message: {0}")]
    Decode(String),

    #[error("no known address for rank {0}")]
    UnknownRank(common::Rank),

    #[error("connection closed by peer")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
