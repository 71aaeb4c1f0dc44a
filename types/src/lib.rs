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

//! Shared data model for the consensus replica: validator sets, views and
//! subjects, the wire message envelope and its RLP codec, and the consensus
//! configuration.
//!
//! This crate deliberately knows nothing about phases, backlogs or
//! dispatch — those live in `ibft-node` and `ibft-network` respectively. It
//! only defines the vocabulary both of them share, the way `exonum::helpers`
//! and `exonum::messages` sit underneath `exonum-node`.

mod address;
mod config;
mod message;
mod subject;
mod validator;
mod view;

pub use address::Address;
pub use config::ConsensusConfig;
pub use message::{
    CommittedSubject, Envelope, ForwardData, MessageCode, MessageError, Payload, PrePrepareData,
    PreparedCertificate, PrepareData, RoundChangeData, SignedMessage,
    SERIALIZED_G1_PUBLIC_KEY_LEN, SERIALIZED_PUBLIC_KEY_LEN, SERIALIZED_SIGNATURE_LEN,
};
pub use subject::{AggregatedSeal, Digest, EpochValidatorSetSeal, Subject};
pub use validator::{ValidatorDescriptor, ValidatorSet};
pub use view::{Round, Sequence, View};
