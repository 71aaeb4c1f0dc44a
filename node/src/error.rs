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

//! The non-fatal error taxonomy of spec §7, as a single `thiserror`-derived
//! enum — one variant per *kind*, not per concrete message, matching how
//! `exonum-node`'s `HandleTxError` collapses many rejection reasons into a
//! small enum rather than a type per message kind.

use thiserror::Error;

use ibft_crypto::CryptoError;
use ibft_types::MessageError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsensusError {
    /// A BLS operation was rejected: a degenerate key, a failed
    /// verification, or an aggregation over an identity element.
    #[error("crypto rejected: {0}")]
    CryptoRejected(#[from] CryptoError),

    /// The envelope itself failed to decode or its signature did not
    /// recover to the declared sender.
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] MessageError),

    /// View strictly less than current, and not a valid previous-sequence
    /// commit.
    #[error("message view is strictly older than the current view")]
    OldMessage,

    /// View strictly greater than current but within the backlog horizon.
    #[error("message view is ahead of the current view and was backlogged")]
    FutureMessage,

    /// View strictly greater than current and beyond the backlog horizon.
    #[error("message view is too far ahead of the current view")]
    FutureMessageBeyondHorizon,

    /// Commit/Prepare digest disagrees with the current proposal.
    #[error("subject {0} does not match the current subject {1}")]
    InconsistentSubject(String, String),

    /// Sender is not a member of the active validator set.
    #[error("sender is not a member of the validator set")]
    InvalidValidator,

    /// An epoch-validator-set seal was supplied for a non-epoch-boundary
    /// block. Per spec §7 this is *not* an error condition for the caller —
    /// it is surfaced here only so the replica can log it; handling treats
    /// it as an empty seal.
    #[error("epoch-validator-set seal supplied for a non-epoch-boundary block")]
    NotLastBlockInEpoch,

    /// Sender did not match the expected proposer for this view.
    #[error("sender is not the proposer for this view")]
    WrongProposer,

    /// A `PrePrepare` switched subjects across rounds of the same sequence
    /// without a round-change justification.
    #[error("PrePrepare switches subject without a justifying round-change certificate")]
    MissingJustification,

    /// Parent linkage (prev-hash) did not match.
    #[error("proposal does not extend the expected parent block")]
    BadParentLinkage,
}

/// The trichotomy spec §4.1 names for `handle(msg)`.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Backlogged,
    Rejected(ConsensusError),
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted)
    }
}
