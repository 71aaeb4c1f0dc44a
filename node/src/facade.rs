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

//! The integration facade consumed by the block producer (spec §4.1
//! dependency order, item f): owns the `Replica` and performs the eager
//! `FatalConfig` validation spec §7 assigns to startup, so a malformed
//! configuration aborts construction instead of surfacing as a confusing
//! failure on the first message handled.
//!
//! Mirrors the split `exonum-node`'s `NodeConfig: ValidateInput` makes
//! between fallible startup checks (`anyhow::Result`, meant to abort the
//! process) and per-message recoverable outcomes (`ConsensusError`,
//! `Outcome`) — `ConsensusFacade::new` is the only fallible-with-`anyhow`
//! entry point in this crate; every method after construction returns the
//! same `Outcome`/effect-queue vocabulary `Replica` already exposes.

use anyhow::{ensure, Context, Result};

use ibft_crypto::ForkContext;
use ibft_network::Effect;
use ibft_types::{Address, AggregatedSeal, ConsensusConfig, Digest, Sequence, ValidatorSet};

use crate::error::Outcome;
use crate::replica::{ChainInterface, Replica};
use crate::timer::TimerRequest;

/// A validated, ready-to-drive consensus replica.
pub struct ConsensusFacade<C: ChainInterface> {
    replica: Replica<C>,
}

impl<C: ChainInterface> ConsensusFacade<C> {
    /// Validates `config` and `validators` and constructs the replica for
    /// the genesis sequence. Fails fast on what spec §7 calls `FatalConfig`
    /// ("missing fork heights, malformed genesis") rather than deferring
    /// the check to the first message handled.
    pub fn new(
        our_address: Address,
        our_signing_key: secp256k1::SecretKey,
        config: ConsensusConfig,
        fork: ForkContext,
        validators: ValidatorSet,
        chain: C,
    ) -> Result<Self> {
        config
            .validate()
            .context("consensus configuration failed validation at startup")?;
        ensure!(
            validators.n() >= 1,
            "validator set must contain at least one validator"
        );
        ensure!(
            validators.contains(&our_address),
            "this replica's own address is not a member of the starting validator set"
        );
        Ok(Self {
            replica: Replica::new(our_address, our_signing_key, config, fork, validators, chain),
        })
    }

    /// Starts a fresh sequence, delegating to [`Replica::start`].
    pub fn start(&mut self, sequence: Sequence, validators: ValidatorSet) -> Option<AggregatedSeal> {
        self.replica.start(sequence, validators)
    }

    /// Proposes `digest` for the current view, if this replica is the
    /// proposer. Returns the recoverable [`crate::error::ConsensusError`]
    /// rather than `anyhow::Error` — proposing out of turn is a caller bug,
    /// not a startup-fatal condition.
    pub fn propose(&mut self, digest: Digest, proposal: Vec<u8>) -> Result<(), crate::error::ConsensusError> {
        self.replica.propose(digest, proposal)
    }

    pub fn handle(&mut self, msg: ibft_types::SignedMessage) -> Outcome {
        self.replica.handle(msg)
    }

    pub fn on_timeout(&mut self, generation: u64) {
        self.replica.on_timeout(generation)
    }

    pub fn drain_effects(&mut self) -> Vec<Effect> {
        self.replica.drain_effects()
    }

    pub fn take_pending_timer(&mut self) -> Option<TimerRequest> {
        self.replica.take_pending_timer()
    }

    pub fn replica(&self) -> &Replica<C> {
        &self.replica
    }

    pub fn replica_mut(&mut self) -> &mut Replica<C> {
        &mut self.replica
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibft_crypto::SecretKey as BlsSecretKey;
    use ibft_types::ValidatorDescriptor;
    use secp256k1::{PublicKey as EcdsaPublicKey, Secp256k1, SecretKey as EcdsaSecretKey};

    struct NullChain;

    impl ChainInterface for NullChain {
        fn next_block_validators(&self, _proposal_digest: &Digest) -> ValidatorSet {
            unimplemented!("not exercised by these tests")
        }
        fn hash_for_block(&self, _sequence: Sequence) -> Option<Digest> {
            None
        }
        fn sign_bls(
            &self,
            _msg: &[u8],
            _extra_data: &[u8],
            _use_composite: bool,
            _fork: ForkContext,
        ) -> ibft_crypto::Signature {
            unimplemented!("not exercised by these tests")
        }
        fn on_finalized(&mut self, _finalized: crate::replica::FinalizedBlock) {}
    }

    fn validator_set_with(address: Address) -> ValidatorSet {
        let mut ikm = [9u8; 32];
        ikm[0] ^= 0x33;
        let bls_sk = BlsSecretKey::from_bytes(&ikm).unwrap();
        ValidatorSet::new(vec![ValidatorDescriptor {
            address,
            bls_public_key: bls_sk.public_key(),
        }])
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let secp = Secp256k1::new();
        let sk = EcdsaSecretKey::from_slice(&[3u8; 32]).unwrap();
        let pk = EcdsaPublicKey::from_secret_key(&secp, &sk);
        let address = Address::from_public_key(&pk);
        let validators = validator_set_with(address);

        let bad_config = ConsensusConfig {
            round_timeout_base_ms: 0,
            round_timeout_growth: 1.5,
            round_timeout_cap_ms: 1000,
            epoch_length: 10,
            backlog_capacity_per_sender: 4,
            max_validators: 150,
            max_non_signers: 0,
            future_message_horizon: 10,
        };

        let result = ConsensusFacade::new(
            address,
            sk,
            bad_config,
            ForkContext::new(1_000, 1),
            validators,
            NullChain,
        );
        assert!(result.is_err());
    }

    #[test]
    fn our_address_not_in_validator_set_is_rejected() {
        let secp = Secp256k1::new();
        let sk = EcdsaSecretKey::from_slice(&[3u8; 32]).unwrap();
        let pk = EcdsaPublicKey::from_secret_key(&secp, &sk);
        let our_address = Address::from_public_key(&pk);

        let other_sk = EcdsaSecretKey::from_slice(&[4u8; 32]).unwrap();
        let other_pk = EcdsaPublicKey::from_secret_key(&secp, &other_sk);
        let other_address = Address::from_public_key(&other_pk);
        let validators = validator_set_with(other_address);

        let result = ConsensusFacade::new(
            our_address,
            sk,
            ConsensusConfig::default(),
            ForkContext::new(1_000, 1),
            validators,
            NullChain,
        );
        assert!(result.is_err());
    }

    #[test]
    fn valid_config_constructs_successfully() {
        let secp = Secp256k1::new();
        let sk = EcdsaSecretKey::from_slice(&[3u8; 32]).unwrap();
        let pk = EcdsaPublicKey::from_secret_key(&secp, &sk);
        let address = Address::from_public_key(&pk);
        let validators = validator_set_with(address);

        let result = ConsensusFacade::new(
            address,
            sk,
            ConsensusConfig::default(),
            ForkContext::new(1_000, 1),
            validators,
            NullChain,
        );
        assert!(result.is_ok());
    }
}
