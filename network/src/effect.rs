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

//! The effects a replica appends to its outbound queue instead of calling
//! into the network directly (spec §9, "model the state machine as a pure
//! state transformer plus an effect queue"). `Dispatch` is the only thing
//! that interprets them.

use ibft_types::{Address, MessageCode};

/// One outbound side effect of a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Fire-and-forget send to a single peer.
    Unicast {
        to: Address,
        code: MessageCode,
        payload: Vec<u8>,
    },
    /// Send to each address concurrently. `send_to_self` additionally posts
    /// the payload to the local inbound queue; `send_to_account` additionally
    /// samples a subset of non-validator peers (spec §4.6).
    Multicast {
        to: Vec<Address>,
        code: MessageCode,
        payload: Vec<u8>,
        send_to_self: bool,
        send_to_account: bool,
    },
    /// Send to all peers, filtered through the gossip cache.
    Gossip { code: MessageCode, payload: Vec<u8> },
}
