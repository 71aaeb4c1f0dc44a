// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Block sequence numbers, in-sequence rounds, and the `(sequence, round)`
//! view they form together.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A block height being decided. Increases monotonically as blocks finalize.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sequence(pub u64);

impl Sequence {
    pub fn zero() -> Self {
        Sequence(0)
    }

    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn previous(self) -> Option<Self> {
        self.0.checked_sub(1).map(Sequence)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An in-sequence retry counter. Resets to zero whenever the sequence
/// advances; increments on timeout or justified round-change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Round(pub u64);

impl Round {
    pub fn zero() -> Self {
        Round(0)
    }

    pub fn next(self) -> Self {
        Round(self.0 + 1)
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `(sequence, round)` pair, ordered lexicographically: `(S, R) < (S', R')`
/// iff `S < S'`, or `S == S'` and `R < R'`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct View {
    pub sequence: Sequence,
    pub round: Round,
}

impl View {
    pub fn new(sequence: Sequence, round: Round) -> Self {
        Self { sequence, round }
    }

    /// The view that starts a fresh sequence: round resets to zero.
    pub fn start_of(sequence: Sequence) -> Self {
        Self {
            sequence,
            round: Round::zero(),
        }
    }

    pub fn with_round(self, round: Round) -> Self {
        Self {
            sequence: self.sequence,
            round,
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(S={}, R={})", self.sequence, self.round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_order_lexicographically() {
        let a = View::new(Sequence(1), Round(5));
        let b = View::new(Sequence(1), Round(6));
        let c = View::new(Sequence(2), Round(0));
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn start_of_resets_round() {
        let view = View::start_of(Sequence(7));
        assert_eq!(view.round, Round::zero());
    }
}
