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

//! The dispatch fabric: unicast/multicast/gossip atop a peer set, a gossip
//! cache that suppresses duplicate non-consensus-critical gossip, and the
//! per-sequence forwarded-message dedup table (spec §4.6).
//!
//! Like `exonum-node` splits the event loop (`NodeHandler`) from the
//! network half (`events::network::NetworkPart`), this crate never touches
//! `RoundState` or decides *whether* to send — it only knows how to fan a
//! payload out once the replica has decided to. The replica appends
//! [`Effect`]s to a queue; `Dispatch` drains that queue against a
//! [`PeerSender`].

mod connect_list;
mod dispatch;
mod effect;
mod forwarded;
mod gossip;

pub use connect_list::{ConnectInfo, ConnectList};
pub use dispatch::{Dispatch, PeerSender, ProxyForwarder};
pub use effect::Effect;
pub use forwarded::{ForwardKey, ForwardedSet};
pub use gossip::GossipCache;
