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

//! Per-peer payload dedup for [`Effect::Gossip`](crate::Effect::Gossip):
//! a payload already sent to (or received from) a peer is never sent to it
//! again.

use std::collections::HashSet;

use sha3::{Digest, Keccak256};

use ibft_types::Address;

type PayloadHash = [u8; 32];

fn hash_of(payload: &[u8]) -> PayloadHash {
    let digest = Keccak256::digest(payload);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Tracks, per `(peer, payload-hash)`, whether a peer has already sent or
/// been sent a given payload. Self-origination is recorded too, so a
/// gossiped message echoed back by a peer is recognized and ignored rather
/// than re-gossiped.
#[derive(Debug, Default)]
pub struct GossipCache {
    seen: HashSet<(Address, PayloadHash)>,
    originated: HashSet<PayloadHash>,
}

impl GossipCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `payload` as something we produced locally, so that an echo of
    /// it arriving back from a peer is recognized as our own gossip rather
    /// than new information.
    pub fn mark_originated(&mut self, payload: &[u8]) {
        self.originated.insert(hash_of(payload));
    }

    pub fn is_own_origin(&self, payload: &[u8]) -> bool {
        self.originated.contains(&hash_of(payload))
    }

    /// Returns `true` if `payload` has never been exchanged with `peer`
    /// (in either direction) and records that it now has.
    pub fn record_and_should_send(&mut self, peer: Address, payload: &[u8]) -> bool {
        let key = (peer, hash_of(payload));
        self.seen.insert(key)
    }

    /// Records that `payload` was received from `peer`, without querying
    /// send eligibility — used when the cache observes inbound gossip
    /// rather than deciding outbound fan-out.
    pub fn record_received(&mut self, peer: Address, payload: &[u8]) {
        self.seen.insert((peer, hash_of(payload)));
    }

    pub fn has_been_exchanged_with(&self, peer: &Address, payload: &[u8]) -> bool {
        self.seen.contains(&(*peer, hash_of(payload)))
    }
}
