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

//! Mapping between validator addresses and the peer handle used to reach
//! them, plus the set of non-validator peers multicast may additionally
//! sample into.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ibft_types::Address;

/// Address/endpoint pair for a single connectable peer, the way
/// `exonum-node`'s `ConnectInfo` pairs a validator public key with a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnectInfo {
    pub address: Address,
    pub endpoint: String,
    /// Whether this peer is a member of the current validator set. Non-
    /// validator peers are never multicast targets directly, but are the
    /// pool `sendToAccount` sampling draws from (spec §4.6).
    pub is_validator: bool,
}

/// The address → endpoint table the dispatch fabric resolves validator
/// addresses and `sendToAccount` samples against.
#[derive(Debug, Default, Clone)]
pub struct ConnectList {
    peers: BTreeMap<Address, ConnectInfo>,
}

impl ConnectList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: ConnectInfo) {
        self.peers.insert(peer.address, peer);
    }

    pub fn is_peer_allowed(&self, address: &Address) -> bool {
        self.peers.contains_key(address)
    }

    pub fn endpoint_of(&self, address: &Address) -> Option<&str> {
        self.peers.get(address).map(|p| p.endpoint.as_str())
    }

    pub fn validator_peers(&self) -> impl Iterator<Item = &ConnectInfo> {
        self.peers.values().filter(|p| p.is_validator)
    }

    pub fn non_validator_peers(&self) -> impl Iterator<Item = &ConnectInfo> {
        self.peers.values().filter(|p| !p.is_validator)
    }

    pub fn all_peers(&self) -> impl Iterator<Item = &ConnectInfo> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
