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

//! Identifiers, wire config and small shared utilities used by every other
//! crate in the workspace.

mod config;
mod ids;
mod stats;

pub use config::ClusterConfig;
pub use ids::{Epoch, Rank, ShardId, TableId};
pub use stats::Stats;

/// The `bincode` configuration every crate must encode/decode with. Kept in
/// one place so a drift between the writer and reader side is impossible.
pub fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

/// Installs a `tracing` subscriber that writes to stderr at the level named
/// by `RUST_LOG`, falling back to `info`. Safe to call more than once; only
/// the first call takes effect.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
