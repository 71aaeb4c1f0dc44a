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

//! Epoch-boundary certificate assembly (spec §4.5): the `τ` committed by
//! each validator over the next epoch's epoch-SNARK data, and its
//! aggregation into the block's `EpochValidatorSetSeal`.

use bit_vec::BitVec;

use ibft_crypto::{self as crypto, EpochSnarkData, ForkContext, PublicKey, Signature};
use ibft_types::{Address, EpochValidatorSetSeal, ValidatorSet};

use crate::error::ConsensusError;

/// Encodes the epoch-SNARK data for the validator set that will be active
/// in the epoch following `epoch_index`, padded to `config.max_validators`.
pub fn epoch_snark_data(
    next_validators: &ValidatorSet,
    max_non_signers: u32,
    max_validators: usize,
    epoch_index: u64,
    round: u8,
    entropy: &[u8],
    parent_entropy: &[u8],
) -> EpochSnarkData {
    let pubkeys: Vec<PublicKey> = next_validators
        .iter()
        .map(|v| v.bls_public_key.clone())
        .collect();
    crypto::encode_epoch_snark_data_cip22(
        &pubkeys,
        max_non_signers,
        max_validators,
        epoch_index,
        round,
        entropy,
        parent_entropy,
    )
}

/// Verifies a single validator's `τ` against the epoch-SNARK data computed
/// for the *next* epoch's validator set (spec §4.5: the state machine
/// verifies `τ` against the set elected during epoch `E`, active in
/// `E + 1`, never against the currently-active set `V`).
pub fn verify_epoch_seal(
    signer_bls_key: &PublicKey,
    data: &EpochSnarkData,
    tau: &[u8],
    fork: ForkContext,
) -> Result<(), ConsensusError> {
    let sig = Signature::from_bytes(tau).map_err(ConsensusError::CryptoRejected)?;
    crypto::verify(signer_bls_key, &data.message, &data.extra_data, &sig, true, fork)
        .map_err(ConsensusError::CryptoRejected)
}

/// Aggregates the `τ` signatures collected from a commit quorum into the
/// block's `EpochValidatorSetSeal`. `signers` must all be distinct members
/// of `validators` (callers are expected to have deduplicated by address
/// already, since that's also a commit-set invariant).
pub fn aggregate_epoch_seal(
    signers: &[(Address, Vec<u8>)],
    validators: &ValidatorSet,
) -> Result<EpochValidatorSetSeal, ConsensusError> {
    if signers.is_empty() {
        return Ok(EpochValidatorSetSeal::empty(validators.n()));
    }

    let mut bitmap = BitVec::from_elem(validators.n(), false);
    let mut sigs = Vec::with_capacity(signers.len());
    for (address, tau) in signers {
        let index = validators
            .index_of(address)
            .ok_or(ConsensusError::InvalidValidator)?;
        bitmap.set(index, true);
        sigs.push(Signature::from_bytes(tau).map_err(ConsensusError::CryptoRejected)?);
    }

    let aggregated = crypto::aggregate_signatures(&sigs).map_err(ConsensusError::CryptoRejected)?;
    Ok(EpochValidatorSetSeal {
        signer_bitmap: bitmap,
        signature: aggregated.to_bytes(),
    })
}
