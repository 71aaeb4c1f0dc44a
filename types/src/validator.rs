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

//! The validator set: an ordered, epoch-immutable list of validator
//! descriptors, plus the quorum arithmetic and default proposer-selection
//! rule the replica state machine is built on.

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::view::{Round, Sequence};
use ibft_crypto::PublicKey;

/// One validator: its address (used in the wire envelope and for quorum
/// bookkeeping) and its BLS public key (used for committed-seal and
/// epoch-seal verification). Every validator carries equal weight, per
/// spec §3.
#[derive(Clone)]
pub struct ValidatorDescriptor {
    pub address: Address,
    pub bls_public_key: PublicKey,
}

/// An ordered, epoch-immutable validator set. `V` changes only at epoch
/// boundaries; within an epoch every consumer treats it as a plain
/// read-only slice, mirroring how `exonum-node`'s `ConsensusConfig`
/// validator list is copy-on-epoch.
#[derive(Clone)]
pub struct ValidatorSet {
    validators: Vec<ValidatorDescriptor>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<ValidatorDescriptor>) -> Self {
        assert!(!validators.is_empty(), "a validator set cannot be empty");
        Self { validators }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidatorDescriptor> {
        self.validators.iter()
    }

    pub fn get(&self, index: usize) -> Option<&ValidatorDescriptor> {
        self.validators.get(index)
    }

    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.validators.iter().position(|v| &v.address == address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.index_of(address).is_some()
    }

    /// `n`, the validator count.
    pub fn n(&self) -> usize {
        self.validators.len()
    }

    /// `f = floor((n - 1) / 3)`, the Byzantine tolerance.
    pub fn f(&self) -> usize {
        (self.n() - 1) / 3
    }

    /// `q = ceil(2n / 3)`, the minimum quorum size.
    pub fn quorum(&self) -> usize {
        (2 * self.n() + 2) / 3
    }

    /// The default proposer-selection rule: round-robin by validator index
    /// within the epoch, with the round adding a further rotation —
    /// `proposer(V, S, R) = V[(S + R) mod n]`. Pure function of `(V, S, R)`
    /// only, per spec §4.1.
    pub fn proposer(&self, sequence: Sequence, round: Round) -> &ValidatorDescriptor {
        let index = (sequence.0.wrapping_add(round.0)) as usize % self.n();
        &self.validators[index]
    }

    pub fn proposer_index(&self, sequence: Sequence, round: Round) -> usize {
        (sequence.0.wrapping_add(round.0)) as usize % self.n()
    }
}

/// A compact, epoch-scoped configuration point: which proposer-selection
/// rule to use. The state machine only ever calls through this trait, so an
/// alternative rule can be swapped in without touching replica code (spec
/// §4.1: "proposer selection is pluggable but deterministic").
pub trait ProposerSelector {
    fn proposer_index(&self, validators: &ValidatorSet, sequence: Sequence, round: Round) -> usize;
}

/// The default round-robin-with-rotation rule.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct RoundRobinProposer;

impl ProposerSelector for RoundRobinProposer {
    fn proposer_index(&self, validators: &ValidatorSet, sequence: Sequence, round: Round) -> usize {
        validators.proposer_index(sequence, round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(seed: u8) -> ValidatorDescriptor {
        let mut ikm = [seed; 32];
        ikm[0] ^= 0x42;
        let sk = ibft_crypto::SecretKey::from_bytes(&ikm).unwrap();
        ValidatorDescriptor {
            address: Address([seed; 20]),
            bls_public_key: sk.public_key(),
        }
    }

    fn set_of(n: u8) -> ValidatorSet {
        ValidatorSet::new((1..=n).map(descriptor).collect())
    }

    #[test]
    fn quorum_matches_spec_table() {
        assert_eq!(set_of(4).quorum(), 3);
        assert_eq!(set_of(4).f(), 1);
        assert_eq!(set_of(7).quorum(), 5);
        assert_eq!(set_of(7).f(), 2);
        assert_eq!(set_of(1).quorum(), 1);
        assert_eq!(set_of(1).f(), 0);
    }

    #[test]
    fn proposer_rotates_round_robin() {
        let set = set_of(4);
        assert_eq!(set.proposer_index(Sequence(1), Round(0)), 1);
        assert_eq!(set.proposer_index(Sequence(1), Round(1)), 2);
        assert_eq!(set.proposer_index(Sequence(2), Round(0)), 2);
    }
}
