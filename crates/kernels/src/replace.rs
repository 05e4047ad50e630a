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

/// Wraps a value for a table whose accumulator is always
/// `Accumulator::Replace`. `GlobalTable` requires every value type to
/// support `PartialOrd`/`Add` so its generic merge path compiles for
/// `Min`/`Max`/`Sum` tables too, even though a `Replace`-only table never
/// calls either. `Repl` satisfies the bound without claiming an ordering
/// or a sum the wrapped type doesn't have.
#[derive(Debug, Clone, PartialEq, Default, Encode, Decode)]
pub struct Repl<T>(pub T);

impl<T> PartialOrd for Repl<T> {
    fn partial_cmp(&self, _other: &Self) -> Option<std::cmp::Ordering> {
        None
    }
}

impl<T> std::ops::Add for Repl<T> {
    type Output = Repl<T>;

    /// Never called: every table `Repl` is used for is declared with
    /// `Accumulator::Replace`, whose merge never reaches `Add`.
    fn add(self, _rhs: Repl<T>) -> Repl<T> {
        self
    }
}
