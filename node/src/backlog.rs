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

//! Holds messages that arrived ahead of the current phase/view so they can
//! be re-examined without re-fetching (spec §4.2).
//!
//! Keyed by sender address, ordered by view within a sender. On every
//! state transition the backlog is drained against the new current view:
//! entries with a view in the past are discarded, entries matching the new
//! current view are handed back to the caller for replay, and entries still
//! ahead of the new view are kept.

use std::collections::BTreeMap;

use log::trace;

use ibft_types::{Address, SignedMessage, View};

/// A per-sender, view-ordered holding pen for not-yet-actionable messages.
#[derive(Debug)]
pub struct Backlog {
    capacity_per_sender: usize,
    entries: BTreeMap<Address, BTreeMap<View, SignedMessage>>,
}

impl Backlog {
    pub fn new(capacity_per_sender: usize) -> Self {
        Self {
            capacity_per_sender,
            entries: BTreeMap::new(),
        }
    }

    /// Inserts `msg`, evicting the sender's oldest (lowest-view) entry if
    /// this would put the sender over `capacity_per_sender`.
    pub fn insert(&mut self, sender: Address, view: View, msg: SignedMessage) {
        let per_sender = self.entries.entry(sender).or_default();
        per_sender.insert(view, msg);
        while per_sender.len() > self.capacity_per_sender {
            if let Some(&oldest) = per_sender.keys().next() {
                trace!("backlog for {:?} over capacity, evicting view {}", sender, oldest);
                per_sender.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Drains the backlog against `current_view`: messages older than
    /// `current_view` are discarded; messages exactly at `current_view` are
    /// removed and returned, in ascending `(sender, view)` order for
    /// determinism; messages still ahead of `current_view` are left in
    /// place.
    pub fn drain_matching(&mut self, current_view: View) -> Vec<SignedMessage> {
        let mut matched = Vec::new();
        let mut empty_senders = Vec::new();

        for (sender, per_sender) in self.entries.iter_mut() {
            let stale_views: Vec<View> = per_sender
                .range(..current_view)
                .map(|(view, _)| *view)
                .collect();
            for view in stale_views {
                per_sender.remove(&view);
            }

            if let Some(msg) = per_sender.remove(&current_view) {
                matched.push((*sender, msg));
            }

            if per_sender.is_empty() {
                empty_senders.push(*sender);
            }
        }

        for sender in empty_senders {
            self.entries.remove(&sender);
        }

        matched.sort_by_key(|(sender, _)| *sender);
        matched.into_iter().map(|(_, msg)| msg).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
