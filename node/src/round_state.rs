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

//! `RoundState`: what a replica has observed for one `(sequence, round)`
//! (spec §3). Owns the Prepare/Commit bookkeeping and phase; everything
//! that survives across rounds of the same sequence (the preferred
//! subject, parent commits, round-change votes) lives one level up, in
//! `Replica`.

use std::collections::BTreeMap;

use ibft_types::{Address, PreparedCertificate, SignedMessage, Subject, View};

/// The replica's progress through one sequence's voting, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    AcceptRequest,
    Preprepared,
    Prepared,
    Committed,
    WaitingForNewRound,
}

/// The mutable voting record for one `(sequence, round)`.
#[derive(Debug)]
pub struct RoundState {
    pub view: View,
    pub phase: Phase,
    pub subject: Option<Subject>,
    prepares: BTreeMap<Address, SignedMessage>,
    commits: BTreeMap<Address, SignedMessage>,
}

impl RoundState {
    pub fn new(view: View) -> Self {
        Self {
            view,
            phase: Phase::AcceptRequest,
            subject: None,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
        }
    }

    /// Records a Prepare, idempotently by sender (invariant 1 of spec §3).
    /// Returns `false` if this sender had already prepared for this round.
    pub fn record_prepare(&mut self, sender: Address, msg: SignedMessage) -> bool {
        self.prepares.insert(sender, msg).is_none()
    }

    /// Records a Commit, idempotently by sender.
    pub fn record_commit(&mut self, sender: Address, msg: SignedMessage) -> bool {
        self.commits.insert(sender, msg).is_none()
    }

    pub fn has_prepared(&self, sender: &Address) -> bool {
        self.prepares.contains_key(sender)
    }

    pub fn has_committed(&self, sender: &Address) -> bool {
        self.commits.contains_key(sender)
    }

    pub fn prepare_count(&self) -> usize {
        self.prepares.len()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    /// `|Prepares ∪ Commits|` — a validator that both prepared and
    /// committed for this subject is only counted once (invariant 2).
    pub fn prepare_or_commit_count(&self) -> usize {
        self.prepares
            .keys()
            .chain(self.commits.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    }

    pub fn commits(&self) -> impl Iterator<Item = (&Address, &SignedMessage)> {
        self.commits.iter()
    }

    pub fn prepares(&self) -> impl Iterator<Item = (&Address, &SignedMessage)> {
        self.prepares.iter()
    }

    /// Builds a `PreparedCertificate` from the currently recorded prepares
    /// for `subject`, for use as round-change justification (spec §4.1,
    /// §4.3). Callers are expected to have already checked that a quorum
    /// was reached.
    pub fn build_prepared_certificate(&self, subject: Subject) -> PreparedCertificate {
        let prepares = self
            .prepares
            .values()
            .map(|signed| signed.envelope.clone())
            .collect();
        PreparedCertificate { subject, prepares }
    }
}
