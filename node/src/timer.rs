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

//! The round/timeout controller (spec §4.3): a single per-sequence
//! deadline that grows geometrically (and is capped) with each round
//! advance.
//!
//! This crate owns no clock or executor — per spec §5 the round timer is a
//! cancel-and-replace `TimeoutRequest`, exactly like `exonum-node`'s
//! `add_round_timeout`/`add_timeout`: the replica asks the embedder to
//! schedule a timer by emitting a [`TimerRequest`] carrying a generation
//! number, and the embedder calls `on_timeout` back with that same
//! generation once it fires. A generation that no longer matches the
//! controller's current one is stale — it was superseded by a later
//! request (finalize, or another round advance) — and is ignored.

use ibft_types::{ConsensusConfig, View};

/// A request to schedule a round timeout. `generation` lets the embedder's
/// timer plumbing, and `RoundTimer::on_timeout`, recognize a timer that was
/// superseded before it fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub view: View,
    pub generation: u64,
    pub duration_ms: u64,
}

/// Tracks the currently outstanding round timeout for one sequence.
#[derive(Debug, Default)]
pub struct RoundTimer {
    generation: u64,
}

impl RoundTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels whatever was previously outstanding and requests a fresh
    /// timeout for `view`, sized by `config`'s geometric growth rule.
    pub fn request(&mut self, view: View, config: &ConsensusConfig) -> TimerRequest {
        self.generation += 1;
        TimerRequest {
            view,
            generation: self.generation,
            duration_ms: config.round_timeout_ms(view.round),
        }
    }

    /// `true` if `generation` is the most recently requested one — i.e. the
    /// fired timeout was not cancelled by a subsequent request.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Cancels the outstanding timeout without scheduling a new one (called
    /// on finalize, spec §5 "Cancellation and timeouts").
    pub fn cancel(&mut self) {
        self.generation += 1;
    }
}
