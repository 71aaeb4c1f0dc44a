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

//! CIP22 epoch-SNARK-data encoding: the deterministic, fixed-size message
//! signed by `τ` (the epoch-validator-set seal) at an epoch boundary.
//!
//! The encoding is padded to [`crate::MAX_VALIDATORS`] so that every epoch
//! transition — regardless of how many validators actually sit in the next
//! set — produces a proof of the same shape for downstream succinct-proof
//! verification. This padding is a protocol invariant, not an optimization:
//! changing it silently would break every prior epoch's proof.

use crate::{PublicKey, MAX_VALIDATORS};

/// The message and extra-data pair produced by [`encode_epoch_snark_data_cip22`],
/// ready to be passed to [`crate::sign`]/[`crate::verify`] as `(msg, extra_data)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochSnarkData {
    /// The hashed, fixed-size message actually signed.
    pub message: Vec<u8>,
    /// Auxiliary data carried alongside the signature but not hashed into
    /// `message` itself (entropy and parent-entropy, which downstream
    /// succinct-proof circuits consume separately).
    pub extra_data: Vec<u8>,
}

/// Encodes the next epoch's validator set plus CIP22 padding and entropy
/// into a deterministic `(message, extra_data)` pair.
///
/// `max_non_signers` bounds how many absent signatures the succinct proof
/// can tolerate; `max_validators` must not exceed [`MAX_VALIDATORS`] (it
/// exists as a parameter, rather than being hardcoded, purely so tests can
/// exercise the padding logic at smaller sizes).
pub fn encode_epoch_snark_data_cip22(
    pubkeys: &[PublicKey],
    max_non_signers: u32,
    max_validators: usize,
    epoch_index: u64,
    round: u8,
    entropy: &[u8],
    parent_entropy: &[u8],
) -> EpochSnarkData {
    debug_assert!(
        max_validators <= MAX_VALIDATORS,
        "max_validators exceeds the protocol ceiling of {}",
        MAX_VALIDATORS
    );
    debug_assert!(
        pubkeys.len() <= max_validators,
        "more public keys than the epoch's declared validator-set ceiling"
    );

    let mut message = Vec::with_capacity(8 + 1 + 4 + pubkeys.len() * crate::SERIALIZED_PUBLIC_KEY_LEN);
    message.extend_from_slice(&epoch_index.to_be_bytes());
    message.push(round);
    message.extend_from_slice(&max_non_signers.to_be_bytes());
    message.extend_from_slice(&(pubkeys.len() as u32).to_be_bytes());

    for pk in pubkeys {
        let mut padded = pk.to_bytes();
        padded.resize(crate::SERIALIZED_PUBLIC_KEY_LEN, 0);
        message.extend_from_slice(&padded);
    }
    // Pad remaining validator slots up to `max_validators` with all-zero
    // placeholder keys so the message length is independent of the actual
    // validator-set size for a given epoch configuration.
    for _ in pubkeys.len()..max_validators {
        message.extend_from_slice(&vec![0u8; crate::SERIALIZED_PUBLIC_KEY_LEN]);
    }

    let mut extra_data = Vec::with_capacity(entropy.len() + parent_entropy.len() + 8);
    extra_data.extend_from_slice(&(entropy.len() as u32).to_be_bytes());
    extra_data.extend_from_slice(entropy);
    extra_data.extend_from_slice(&(parent_entropy.len() as u32).to_be_bytes());
    extra_data.extend_from_slice(parent_entropy);

    EpochSnarkData { message, extra_data }
}
