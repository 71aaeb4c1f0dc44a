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

//! The per-sequence forwarded-message dedup table (spec §4.1 Finalization,
//! §4.6, §9 "Forwarded-map lifetime"): prevents a replica from re-broadcasting
//! a consensus message it did not originate more than once.
//!
//! Scoped to the current sequence by construction — there is no `clear`
//! keyed by sequence number, only [`ForwardedSet::reset`], which the
//! replica calls exactly once per finalize so the set can never leak
//! entries across sequences (the bug the spec's design notes call out
//! explicitly).

use std::collections::HashSet;

use ibft_types::{Address, MessageCode, View};

/// `(kind, sender, view)` — the key a forwarded consensus message is
/// deduplicated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwardKey {
    pub code: MessageCode,
    pub sender: Address,
    pub view: View,
}

impl ForwardKey {
    pub fn new(code: MessageCode, sender: Address, view: View) -> Self {
        Self { code, sender, view }
    }
}

/// A dedup set scoped to exactly one sequence.
#[derive(Debug, Default)]
pub struct ForwardedSet {
    seen: HashSet<ForwardKey>,
}

impl ForwardedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `key` is seen for the current
    /// sequence; `false` on every subsequent call with the same key.
    pub fn should_forward(&mut self, key: ForwardKey) -> bool {
        self.seen.insert(key)
    }

    /// Clears every entry. Called exactly once, by the replica's
    /// finalization path, when the sequence this set was scoped to
    /// completes.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibft_types::{Round, Sequence};

    fn key(sender: u8) -> ForwardKey {
        ForwardKey::new(
            MessageCode::Commit,
            Address([sender; 20]),
            View::new(Sequence(1), Round(0)),
        )
    }

    #[test]
    fn second_forward_of_same_key_is_suppressed() {
        let mut set = ForwardedSet::new();
        assert!(set.should_forward(key(1)));
        assert!(!set.should_forward(key(1)));
    }

    #[test]
    fn reset_clears_the_set_for_a_new_sequence() {
        let mut set = ForwardedSet::new();
        assert!(set.should_forward(key(1)));
        set.reset();
        assert!(set.should_forward(key(1)));
    }
}
