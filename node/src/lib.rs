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

//! The consensus replica: the phase-transition state machine of spec §4,
//! built on the wire/validator-set vocabulary of `ibft-types` and the
//! dispatch fabric of `ibft-network`.
//!
//! Layering mirrors `exonum-node` sitting on top of `exonum::messages` and
//! `exonum::helpers`: this crate owns *when* a validator votes, never *how*
//! a vote reaches a peer.

mod backlog;
mod epoch;
mod error;
mod facade;
mod replica;
mod round_state;
mod timer;

pub use backlog::Backlog;
pub use epoch::{aggregate_epoch_seal, epoch_snark_data, verify_epoch_seal};
pub use error::{ConsensusError, Outcome};
pub use facade::ConsensusFacade;
pub use replica::{ChainInterface, FinalizedBlock, Replica};
pub use round_state::{Phase, RoundState};
pub use timer::{RoundTimer, TimerRequest};
