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

//! Example kernels exercised by the workspace-root integration tests:
//! bipartite matching (trigger-mediated proposal/veto), single-source
//! shortest paths (a `Min`-accumulated relaxation), and a plain `Sum`
//! counter. Each is grounded in one of `examples/original_source/`'s
//! kernels, translated from the original's direct-pointer table access
//! into calls through the `table::Registry` handle the worker runtime
//! hands every kernel invocation.

mod bipartite;
mod counter;
mod replace;
mod shortest_path;

pub use bipartite::{
    build_tables as build_bipartite_tables, BpmtKernel, BpmtParams, LEFT_MATCHES, LEFT_OUT_COSTS, LEFT_OUT_EDGES,
    MATCH_STATS, RIGHT_COSTS, RIGHT_MATCHES,
};
pub use counter::{build_counters_table, AccumulateParams, CounterKernel, COUNTERS};
pub use replace::Repl;
pub use shortest_path::{build_distance_table, ShortestPathKernel, ShortestPathParams, DISTANCE, UNREACHED};
