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

//! The three dispatch primitives of spec §4.6 — `Unicast`, `Multicast`,
//! `Gossip` — plus proxied-validator delegation.
//!
//! `Dispatch` drains [`Effect`]s produced by the replica against a
//! [`PeerSender`]. Per spec §5, each peer send is meant to be a detached
//! task that may block on I/O without delaying the state machine; this
//! crate does not own a runtime (none is in the dependency stack — actual
//! async I/O is an external collaborator per spec §1), so `PeerSender` is
//! the seam: an embedder backs it with per-peer mailboxes/tasks, while this
//! crate's own responsibility stops at deciding *who* gets a payload and
//! *how many times*.

use log::{trace, warn};
use rand::seq::IteratorRandom;

use ibft_types::{Address, MessageCode};

use crate::connect_list::ConnectList;
use crate::effect::Effect;
use crate::gossip::GossipCache;

/// The fire-and-forget primitive a peer send ultimately goes through.
/// Implemented by the embedder (e.g. a per-peer mailbox backed by an async
/// task); `Dispatch` never awaits it, matching spec §5's "dispatch tasks
/// are not cancelled; they complete or fail independently".
pub trait PeerSender {
    fn send(&mut self, to: Address, code: MessageCode, payload: &[u8]);

    /// Posts a payload to the local inbound queue, used for `sendToSelf`.
    fn post_local(&mut self, code: MessageCode, payload: &[u8]) {
        let _ = (code, payload);
    }
}

/// Delegates multicast fan-out to a proxy engine instead of sending
/// directly, for nodes running behind a sentry/proxy (spec §4.6,
/// "Proxied-validator mode").
pub trait ProxyForwarder {
    fn forward(&mut self, to: &[Address], code: MessageCode, payload: &[u8]);
}

/// The dispatch fabric: owns the peer table and gossip cache, and turns
/// [`Effect`]s into calls on a [`PeerSender`].
pub struct Dispatch<S: PeerSender> {
    sender: S,
    connect_list: ConnectList,
    gossip_cache: GossipCache,
    proxy: Option<Box<dyn ProxyForwarder>>,
}

impl<S: PeerSender> Dispatch<S> {
    pub fn new(sender: S, connect_list: ConnectList) -> Self {
        Self {
            sender,
            connect_list,
            gossip_cache: GossipCache::new(),
            proxy: None,
        }
    }

    /// Puts this dispatch fabric into proxied-validator mode: multicast is
    /// delegated to `proxy` rather than performed directly.
    pub fn with_proxy(mut self, proxy: Box<dyn ProxyForwarder>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn connect_list(&self) -> &ConnectList {
        &self.connect_list
    }

    pub fn connect_list_mut(&mut self) -> &mut ConnectList {
        &mut self.connect_list
    }

    pub fn gossip_cache_mut(&mut self) -> &mut GossipCache {
        &mut self.gossip_cache
    }

    /// Applies a single effect. Returns the number of peers a `Unicast`,
    /// `Multicast`, or `Gossip` was actually delivered to — mostly useful
    /// for tests asserting on fan-out size.
    pub fn apply(&mut self, effect: Effect) -> usize {
        match effect {
            Effect::Unicast { to, code, payload } => {
                self.sender.send(to, code, &payload);
                1
            }
            Effect::Multicast {
                to,
                code,
                payload,
                send_to_self,
                send_to_account,
            } => self.multicast(&to, code, &payload, send_to_self, send_to_account),
            Effect::Gossip { code, payload } => self.gossip(code, &payload),
        }
    }

    fn multicast(
        &mut self,
        to: &[Address],
        code: MessageCode,
        payload: &[u8],
        send_to_self: bool,
        send_to_account: bool,
    ) -> usize {
        if let Some(proxy) = self.proxy.as_mut() {
            trace!("delegating multicast of {} peers to proxy", to.len());
            proxy.forward(to, code, payload);
            return to.len();
        }

        let mut sent = 0;
        for address in to {
            if self.connect_list.is_peer_allowed(address) {
                self.sender.send(*address, code, payload);
                sent += 1;
            } else {
                warn!("multicast target {:?} is not a known peer", address);
            }
        }

        if send_to_self {
            self.sender.post_local(code, payload);
        }

        if send_to_account {
            sent += self.send_to_account_sample(code, payload);
        }

        sent
    }

    /// Samples `max(1, floor(non_validator_peers / 3))` non-validator peers
    /// and sends to them, per spec §4.6 and testable property 10.
    fn send_to_account_sample(&mut self, code: MessageCode, payload: &[u8]) -> usize {
        let non_validators: Vec<Address> = self
            .connect_list
            .non_validator_peers()
            .map(|p| p.address)
            .collect();
        if non_validators.is_empty() {
            return 0;
        }
        let sample_size = sample_size(non_validators.len());
        let mut rng = rand::thread_rng();
        let chosen: Vec<Address> = non_validators
            .into_iter()
            .choose_multiple(&mut rng, sample_size);
        for address in &chosen {
            self.sender.send(*address, code, payload);
        }
        chosen.len()
    }

    /// Sends to every known peer, suppressing peers that have already
    /// exchanged this exact payload.
    fn gossip(&mut self, code: MessageCode, payload: &[u8]) -> usize {
        self.gossip_cache.mark_originated(payload);
        let targets: Vec<Address> = self.connect_list.all_peers().map(|p| p.address).collect();
        let mut sent = 0;
        for address in targets {
            if self.gossip_cache.record_and_should_send(address, payload) {
                self.sender.send(address, code, payload);
                sent += 1;
            }
        }
        sent
    }
}

fn sample_size(non_validator_count: usize) -> usize {
    (non_validator_count / 3).max(1).min(non_validator_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct RecordingSender {
        sent: Vec<Address>,
        local: usize,
    }

    impl PeerSender for Rc<RefCell<RecordingSender>> {
        fn send(&mut self, to: Address, _code: MessageCode, _payload: &[u8]) {
            self.borrow_mut().sent.push(to);
        }

        fn post_local(&mut self, _code: MessageCode, _payload: &[u8]) {
            self.borrow_mut().local += 1;
        }
    }

    fn peer(byte: u8, is_validator: bool) -> crate::connect_list::ConnectInfo {
        crate::connect_list::ConnectInfo {
            address: Address([byte; 20]),
            endpoint: format!("peer-{}", byte),
            is_validator,
        }
    }

    #[test]
    fn unicast_sends_to_exactly_one_peer() {
        let recorder = Rc::new(RefCell::new(RecordingSender::default()));
        let mut dispatch = Dispatch::new(recorder.clone(), ConnectList::new());
        let sent = dispatch.apply(Effect::Unicast {
            to: Address([9; 20]),
            code: MessageCode::Prepare,
            payload: vec![],
        });
        assert_eq!(sent, 1);
        assert_eq!(recorder.borrow().sent, vec![Address([9; 20])]);
    }

    #[test]
    fn multicast_skips_unknown_peers_and_honors_send_to_self() {
        let recorder = Rc::new(RefCell::new(RecordingSender::default()));
        let mut list = ConnectList::new();
        list.add(peer(1, true));
        let mut dispatch = Dispatch::new(recorder.clone(), list);

        let sent = dispatch.apply(Effect::Multicast {
            to: vec![Address([1; 20]), Address([99; 20])],
            code: MessageCode::Commit,
            payload: vec![1, 2, 3],
            send_to_self: true,
            send_to_account: false,
        });

        assert_eq!(sent, 1);
        assert_eq!(recorder.borrow().sent, vec![Address([1; 20])]);
        assert_eq!(recorder.borrow().local, 1);
    }

    #[test]
    fn send_to_account_sample_respects_bound() {
        let recorder = Rc::new(RefCell::new(RecordingSender::default()));
        let mut list = ConnectList::new();
        list.add(peer(1, true));
        for i in 2..=10u8 {
            list.add(peer(i, false));
        }
        let mut dispatch = Dispatch::new(recorder.clone(), list);
        let sent = dispatch.apply(Effect::Multicast {
            to: vec![Address([1; 20])],
            code: MessageCode::Commit,
            payload: vec![],
            send_to_self: false,
            send_to_account: true,
        });
        // 9 non-validator peers -> floor(9/3) = 3, plus the 1 validator unicast.
        assert_eq!(sent, 4);
    }

    #[test]
    fn sample_size_has_a_floor_of_one() {
        assert_eq!(sample_size(1), 1);
        assert_eq!(sample_size(2), 1);
        assert_eq!(sample_size(3), 1);
        assert_eq!(sample_size(4), 1);
        assert_eq!(sample_size(9), 3);
    }

    #[test]
    fn gossip_suppresses_duplicates_and_echoes() {
        let recorder = Rc::new(RefCell::new(RecordingSender::default()));
        let mut list = ConnectList::new();
        list.add(peer(1, true));
        list.add(peer(2, true));
        let mut dispatch = Dispatch::new(recorder.clone(), list);

        let payload = vec![7, 7, 7];
        let sent_first = dispatch.apply(Effect::Gossip {
            code: MessageCode::RoundChange,
            payload: payload.clone(),
        });
        assert_eq!(sent_first, 2);

        // A second gossip of the identical payload is fully suppressed.
        let sent_second = dispatch.apply(Effect::Gossip {
            code: MessageCode::RoundChange,
            payload,
        });
        assert_eq!(sent_second, 0);
    }

    #[test]
    fn gossip_never_echoes_back_to_the_peer_it_came_from() {
        let recorder = Rc::new(RefCell::new(RecordingSender::default()));
        let mut list = ConnectList::new();
        list.add(peer(1, true));
        list.add(peer(2, true));
        let mut dispatch = Dispatch::new(recorder.clone(), list);

        let payload = vec![5, 5, 5];
        dispatch
            .gossip_cache_mut()
            .record_received(Address([1; 20]), &payload);

        dispatch.apply(Effect::Gossip {
            code: MessageCode::RoundChange,
            payload,
        });

        assert!(!recorder.borrow().sent.contains(&Address([1; 20])));
        assert!(recorder.borrow().sent.contains(&Address([2; 20])));
    }
}
