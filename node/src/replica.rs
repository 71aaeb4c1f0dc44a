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

//! The replica state machine (spec §4.1): `start`/`handle`/`on_timeout`, the
//! PrePrepare/Prepare/Commit handling rules, and round-change/timeout-driven
//! round advance.
//!
//! `Replica` is a pure state transformer: it never touches the network or a
//! clock directly. Outbound messages accumulate as [`Effect`]s
//! (`drain_effects`), and a round timeout request accumulates as a
//! [`TimerRequest`] (`take_pending_timer`) for the embedder to act on —
//! exactly the split `exonum-node`'s `NodeHandler` makes between deciding
//! what to send and actually sending it.

use std::collections::BTreeMap;

use bit_vec::BitVec;
use log::{trace, warn};

use ibft_crypto::{CryptoError, ForkContext, Signature as BlsSignature};
use ibft_network::{Effect, ForwardKey};
use ibft_types::{
    Address, AggregatedSeal, CommittedSubject, ConsensusConfig, Digest, Envelope, ForwardData,
    EpochValidatorSetSeal, MessageCode, Payload, PrePrepareData, PreparedCertificate, PrepareData,
    Round, RoundChangeData, Sequence, SignedMessage, Subject, ValidatorSet, View,
};

use crate::backlog::Backlog;
use crate::epoch;
use crate::error::{ConsensusError, Outcome};
use crate::round_state::{Phase, RoundState};
use crate::timer::{RoundTimer, TimerRequest};

/// The embedder-provided collaborators the state machine cannot supply for
/// itself (spec §6): chain/block-store lookups, BLS signing custody, and the
/// finalization callback. None of these are network I/O — that stays behind
/// `ibft-network`'s `PeerSender`.
pub trait ChainInterface {
    /// The validator set that will be active in the epoch following the
    /// epoch that finalizes with `proposal_digest` — used to target the
    /// epoch-validator-set seal at the *next* set, never the current one
    /// (spec §4.5).
    fn next_block_validators(&self, proposal_digest: &Digest) -> ValidatorSet;

    /// The digest of the already-finalized block at `sequence`, or `None`
    /// for the (genesis) case where no such block exists yet.
    fn hash_for_block(&self, sequence: Sequence) -> Option<Digest>;

    /// Signs `msg || extra_data` with this replica's BLS key under the
    /// domain selected by `(use_composite, fork)`. Key custody is the
    /// embedder's responsibility; the state machine never holds a raw BLS
    /// secret key.
    fn sign_bls(&self, msg: &[u8], extra_data: &[u8], use_composite: bool, fork: ForkContext) -> BlsSignature;

    /// Called exactly once per finalized sequence, with the assembled
    /// certificates.
    fn on_finalized(&mut self, finalized: FinalizedBlock);
}

/// The payload handed to [`ChainInterface::on_finalized`].
#[derive(Debug, Clone)]
pub struct FinalizedBlock {
    pub sequence: Sequence,
    pub digest: Digest,
    pub round: Round,
    pub aggregated_seal: AggregatedSeal,
    pub epoch_validator_set_seal: EpochValidatorSetSeal,
}

enum ViewClass {
    Current,
    Old,
    Future,
}

/// `enc(digest || round)`, the message a committed seal is a BLS signature
/// over (spec §3, §4.4).
fn committed_seal_message(digest: &Digest, round: Round) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    out.extend_from_slice(digest);
    out.extend_from_slice(&round.0.to_be_bytes());
    out
}

/// The consensus replica for a single validator (spec §4.1-§4.4). Generic
/// over `C` so tests can supply an in-memory `ChainInterface` without
/// standing up real storage.
pub struct Replica<C: ChainInterface> {
    our_address: Address,
    our_signing_key: secp256k1::SecretKey,
    config: ConsensusConfig,
    fork: ForkContext,
    validators: ValidatorSet,
    previous_validators: Option<ValidatorSet>,
    sequence: Sequence,
    round: Round,
    parent_digest: Digest,
    round_state: RoundState,
    /// The highest-round `PreparedCertificate` this replica has itself
    /// assembled or accepted as round-change justification this sequence —
    /// "preferred" because a new `PrePrepare` must justify switching away
    /// from it (spec §4.1).
    preferred: Option<(Round, PreparedCertificate)>,
    round_change_votes: BTreeMap<Round, BTreeMap<Address, RoundChangeData>>,
    /// Commit seals observed for the *previous* sequence while at the
    /// current one — the `ParentCommit` set of spec §4.4, consumed by
    /// `start` to build the next `ParentAggregatedSeal`.
    parent_commits: BTreeMap<Address, Vec<u8>>,
    parent_commit_round: Option<Round>,
    /// `τ` signatures collected toward this sequence's epoch-validator-set
    /// seal, if this sequence is an epoch boundary.
    epoch_taus: BTreeMap<Address, Vec<u8>>,
    backlog: Backlog,
    timer: RoundTimer,
    forwarded: ibft_network::ForwardedSet,
    effects: Vec<Effect>,
    pending_timer: Option<TimerRequest>,
    last_finalized: Option<(Sequence, Digest, Round)>,
    chain: C,
}

impl<C: ChainInterface> Replica<C> {
    pub fn new(
        our_address: Address,
        our_signing_key: secp256k1::SecretKey,
        config: ConsensusConfig,
        fork: ForkContext,
        validators: ValidatorSet,
        chain: C,
    ) -> Self {
        let backlog = Backlog::new(config.backlog_capacity_per_sender);
        Self {
            our_address,
            our_signing_key,
            config,
            fork,
            round_state: RoundState::new(View::start_of(Sequence::zero())),
            validators,
            previous_validators: None,
            sequence: Sequence::zero(),
            round: Round::zero(),
            parent_digest: [0u8; 32],
            preferred: None,
            round_change_votes: BTreeMap::new(),
            parent_commits: BTreeMap::new(),
            parent_commit_round: None,
            epoch_taus: BTreeMap::new(),
            backlog,
            timer: RoundTimer::new(),
            forwarded: ibft_network::ForwardedSet::new(),
            effects: Vec::new(),
            pending_timer: None,
            last_finalized: None,
            chain,
        }
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn view(&self) -> View {
        self.current_view()
    }

    pub fn phase(&self) -> Phase {
        self.round_state.phase
    }

    pub fn is_proposer(&self) -> bool {
        self.validators.proposer(self.sequence, self.round).address == self.our_address
    }

    pub fn forwarded_set_mut(&mut self) -> &mut ibft_network::ForwardedSet {
        &mut self.forwarded
    }

    /// Number of distinct validators whose Commit for the current subject
    /// has been recorded. Exposed for callers (and tests) that need to
    /// observe quorum progress without reaching into `RoundState` directly.
    pub fn commit_count(&self) -> usize {
        self.round_state.commit_count()
    }

    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn take_pending_timer(&mut self) -> Option<TimerRequest> {
        self.pending_timer.take()
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    fn current_view(&self) -> View {
        View::new(self.sequence, self.round)
    }

    fn classify(&self, view: View) -> ViewClass {
        let current = self.current_view();
        if view == current {
            ViewClass::Current
        } else if view < current {
            ViewClass::Old
        } else {
            ViewClass::Future
        }
    }

    fn within_horizon(&self, view: View) -> bool {
        view.sequence.0.saturating_sub(self.sequence.0) <= self.config.future_message_horizon
    }

    /// Backlogs a future-view message within the horizon (spec §7,
    /// `FutureMessage`: "within a bounded horizon"); rejects it outright
    /// once past the horizon.
    fn backlog_future(&mut self, sender: Address, view: View, msg: SignedMessage) -> Outcome {
        if self.within_horizon(view) {
            trace!("{:?}: {}", sender, ConsensusError::FutureMessage);
            self.backlog.insert(sender, view, msg);
            Outcome::Backlogged
        } else {
            Outcome::Rejected(ConsensusError::FutureMessageBeyondHorizon)
        }
    }

    fn validator_addresses_except_self(&self) -> Vec<Address> {
        self.validators
            .iter()
            .map(|v| v.address)
            .filter(|a| *a != self.our_address)
            .collect()
    }

    fn emit_multicast(&mut self, code: MessageCode, envelope: &Envelope, send_to_account: bool) {
        let to = self.validator_addresses_except_self();
        self.effects.push(Effect::Multicast {
            to,
            code,
            payload: rlp::encode(envelope).to_vec(),
            send_to_self: false,
            send_to_account,
        });
    }

    /// Re-broadcasts a consensus message this replica did not originate
    /// (spec §4.6): the first time a given `(kind, sender, view)` is seen
    /// this sequence, the original envelope is wrapped in a `Forward`
    /// envelope of our own and multicast onward; every later delivery of
    /// the same key — a duplicate arriving via a different peer, or a
    /// second handling of the same message — is silently dropped by the
    /// `ForwardedSet`, so it is never re-forwarded (spec §8 testable
    /// property, SC-F).
    fn maybe_forward(&mut self, sender: Address, view: View, envelope: Envelope) {
        if sender == self.our_address {
            return;
        }
        let key = ForwardKey::new(envelope.code, sender, view);
        if !self.forwarded.should_forward(key) {
            return;
        }
        let forward_payload = Payload::Forward(ForwardData {
            inner: Box::new(envelope),
        });
        let forward_envelope = Envelope::sign(&forward_payload, &self.our_signing_key);
        self.emit_multicast(MessageCode::Forward, &forward_envelope, false);
    }

    /// Initializes a fresh `RoundState` for `sequence` against `validators`
    /// (spec §4.1). Returns the `ParentAggregatedSeal` assembled from commits
    /// observed for the just-finished sequence, for the caller to embed in
    /// the next proposal if it is the proposer.
    pub fn start(&mut self, sequence: Sequence, validators: ValidatorSet) -> Option<AggregatedSeal> {
        let previous_validators = std::mem::replace(&mut self.validators, validators);
        let parent_seal = self.build_parent_aggregated_seal(&previous_validators);
        self.previous_validators = Some(previous_validators);
        self.parent_commits.clear();
        self.parent_commit_round = None;
        self.epoch_taus.clear();

        self.sequence = sequence;
        self.round = Round::zero();
        self.parent_digest = sequence
            .previous()
            .and_then(|prev| self.chain.hash_for_block(prev))
            .unwrap_or([0u8; 32]);
        self.round_state = RoundState::new(View::start_of(sequence));
        self.preferred = None;
        self.round_change_votes.clear();
        self.forwarded.reset();

        let req = self.timer.request(self.current_view(), &self.config);
        self.pending_timer = Some(req);
        self.drain_backlog();
        parent_seal
    }

    fn build_parent_aggregated_seal(&self, previous_validators: &ValidatorSet) -> Option<AggregatedSeal> {
        if self.parent_commits.is_empty() {
            return None;
        }
        let round = self.parent_commit_round?;
        let mut bitmap = BitVec::from_elem(previous_validators.n(), false);
        let mut sigs = Vec::new();
        for (addr, seal_bytes) in &self.parent_commits {
            if let Some(idx) = previous_validators.index_of(addr) {
                if let Ok(sig) = BlsSignature::from_bytes(seal_bytes) {
                    bitmap.set(idx, true);
                    sigs.push(sig);
                }
            }
        }
        if sigs.is_empty() {
            return None;
        }
        let aggregated = ibft_crypto::aggregate_signatures(&sigs).ok()?;
        Some(AggregatedSeal {
            signer_bitmap: bitmap,
            signature: aggregated.to_bytes(),
            round,
        })
    }

    /// Called by the block producer (out of scope per spec §1) once it has
    /// built a proposal for the current view, if this replica is the
    /// proposer for it.
    pub fn propose(&mut self, digest: Digest, proposal: Vec<u8>) -> Result<(), ConsensusError> {
        if !self.is_proposer() {
            return Err(ConsensusError::WrongProposer);
        }
        if self.round_state.phase != Phase::AcceptRequest {
            return Err(ConsensusError::InconsistentSubject(
                "proposal already accepted for this round".into(),
                format!("{:?}", self.round_state.phase),
            ));
        }
        let view = self.current_view();
        let justification = self.preferred.as_ref().map(|(_, cert)| cert.clone());
        let payload = Payload::PrePrepare(PrePrepareData {
            view,
            digest,
            proposal,
            parent_digest: self.parent_digest,
            justification,
        });
        let envelope = Envelope::sign(&payload, &self.our_signing_key);
        self.emit_multicast(MessageCode::PrePrepare, &envelope, true);
        self.on_preprepare_accepted(view, digest);
        Ok(())
    }

    fn on_preprepare_accepted(&mut self, view: View, digest: Digest) {
        self.round_state.subject = Some(Subject::new(view, digest));
        self.round_state.phase = Phase::Preprepared;
        self.broadcast_prepare(view, digest);
    }

    fn broadcast_prepare(&mut self, view: View, digest: Digest) {
        let payload = Payload::Prepare(PrepareData { view, digest });
        let envelope = Envelope::sign(&payload, &self.our_signing_key);
        let msg = SignedMessage::decode(envelope.clone()).expect("self-signed envelope always verifies");
        self.round_state.record_prepare(self.our_address, msg);
        self.emit_multicast(MessageCode::Prepare, &envelope, false);
        self.maybe_advance_to_prepared();
    }

    fn maybe_advance_to_prepared(&mut self) {
        if self.round_state.phase >= Phase::Prepared {
            return;
        }
        if self.round_state.prepare_or_commit_count() < self.validators.quorum() {
            return;
        }
        let subject = match self.round_state.subject {
            Some(s) => s,
            None => return,
        };
        self.round_state.phase = Phase::Prepared;
        let cert = self.round_state.build_prepared_certificate(subject);
        self.preferred = Some((self.round, cert));
        self.broadcast_commit(subject);
    }

    fn broadcast_commit(&mut self, subject: Subject) {
        if self.round_state.has_committed(&self.our_address) {
            return;
        }
        let seal_msg = committed_seal_message(&subject.digest, subject.view.round);
        let committed_seal = self.chain.sign_bls(&seal_msg, &[], false, self.fork).to_bytes();

        let epoch_validator_set_seal = if self.config.is_epoch_boundary(self.sequence) {
            let next_validators = self.chain.next_block_validators(&subject.digest);
            let data = epoch::epoch_snark_data(
                &next_validators,
                self.config.max_non_signers,
                self.config.max_validators,
                self.sequence.0,
                subject.view.round.0 as u8,
                &subject.digest,
                &self.parent_digest,
            );
            let tau = self.chain.sign_bls(&data.message, &data.extra_data, true, self.fork).to_bytes();
            self.epoch_taus.insert(self.our_address, tau.clone());
            tau
        } else {
            Vec::new()
        };

        let payload = Payload::Commit(CommittedSubject {
            subject,
            committed_seal,
            epoch_validator_set_seal,
        });
        let envelope = Envelope::sign(&payload, &self.our_signing_key);
        let msg = SignedMessage::decode(envelope.clone()).expect("self-signed envelope always verifies");
        self.round_state.record_commit(self.our_address, msg);
        self.emit_multicast(MessageCode::Commit, &envelope, true);
        self.maybe_finalize();
    }

    /// Processes one authenticated incoming message (spec §4.1-§4.4).
    pub fn handle(&mut self, msg: SignedMessage) -> Outcome {
        let sender = msg.sender();
        if !self.validators.contains(&sender) {
            return Outcome::Rejected(ConsensusError::InvalidValidator);
        }
        let SignedMessage { envelope, payload } = msg;
        match payload {
            Payload::PrePrepare(data) => self.handle_preprepare(sender, data, envelope),
            Payload::Prepare(data) => self.handle_prepare(sender, data, envelope),
            Payload::Commit(data) => self.handle_commit(sender, data, envelope),
            Payload::RoundChange(data) => self.handle_round_change(sender, data, envelope),
            Payload::Forward(data) => self.handle_forward(sender, data),
        }
    }

    /// Unwraps a relayed message (spec §4.6): the inner envelope is
    /// authenticated independently of whoever relayed it, then handled
    /// exactly as if it had arrived directly. A relay signed by a
    /// non-validator, or wrapping a malformed inner envelope, is dropped as
    /// `InvalidMessage` without touching any state.
    fn handle_forward(&mut self, _relay: Address, data: ForwardData) -> Outcome {
        let inner = match SignedMessage::decode(*data.inner) {
            Ok(msg) => msg,
            Err(e) => return Outcome::Rejected(ConsensusError::InvalidMessage(e)),
        };
        self.handle(inner)
    }

    fn handle_preprepare(&mut self, sender: Address, data: PrePrepareData, envelope: Envelope) -> Outcome {
        match self.classify(data.view) {
            ViewClass::Old => return Outcome::Rejected(ConsensusError::OldMessage),
            ViewClass::Future => {
                let view = data.view;
                return self.backlog_future(sender, view, SignedMessage {
                    envelope,
                    payload: Payload::PrePrepare(data),
                });
            }
            ViewClass::Current => {}
        }
        if self.round_state.phase != Phase::AcceptRequest {
            // Already pre-prepared (or further) for this round: a second
            // PrePrepare from the proposer is a duplicate, not an error.
            return Outcome::Accepted;
        }
        let expected = self.validators.proposer(self.sequence, self.round).address;
        if sender != expected {
            return Outcome::Rejected(ConsensusError::WrongProposer);
        }
        if data.parent_digest != self.parent_digest {
            return Outcome::Rejected(ConsensusError::BadParentLinkage);
        }
        if let Some((_, preferred_cert)) = &self.preferred {
            if preferred_cert.subject.digest != data.digest {
                let justified = match &data.justification {
                    Some(cert) => {
                        self.validate_prepared_certificate(cert)
                            && cert.subject.digest == preferred_cert.subject.digest
                    }
                    None => false,
                };
                if !justified {
                    return Outcome::Rejected(ConsensusError::MissingJustification);
                }
            }
        }
        let view = data.view;
        self.on_preprepare_accepted(data.view, data.digest);
        self.maybe_forward(sender, view, envelope);
        Outcome::Accepted
    }

    fn handle_prepare(&mut self, sender: Address, data: PrepareData, envelope: Envelope) -> Outcome {
        match self.classify(data.view) {
            ViewClass::Old => return Outcome::Rejected(ConsensusError::OldMessage),
            ViewClass::Future => {
                let view = data.view;
                return self.backlog_future(sender, view, SignedMessage {
                    envelope,
                    payload: Payload::Prepare(data),
                });
            }
            ViewClass::Current => {}
        }
        let subject = match self.round_state.subject {
            Some(s) => s,
            None => {
                // No PrePrepare observed yet this round; hold onto it rather
                // than reject outright, it may arrive out of order.
                let view = data.view;
                self.backlog.insert(sender, view, SignedMessage {
                    envelope,
                    payload: Payload::Prepare(data),
                });
                return Outcome::Backlogged;
            }
        };
        if data.digest != subject.digest {
            return Outcome::Rejected(ConsensusError::InconsistentSubject(
                format!("{:x?}", data.digest),
                format!("{:x?}", subject.digest),
            ));
        }
        let view = data.view;
        let forwarded_envelope = envelope.clone();
        self.round_state.record_prepare(sender, SignedMessage {
            envelope,
            payload: Payload::Prepare(data),
        });
        self.maybe_advance_to_prepared();
        self.maybe_forward(sender, view, forwarded_envelope);
        Outcome::Accepted
    }

    fn handle_commit(&mut self, sender: Address, data: CommittedSubject, envelope: Envelope) -> Outcome {
        let view = data.subject.view;
        match self.classify(view) {
            ViewClass::Old => return self.handle_old_commit(sender, data),
            ViewClass::Future => {
                return self.backlog_future(sender, view, SignedMessage {
                    envelope,
                    payload: Payload::Commit(data),
                });
            }
            ViewClass::Current => {}
        }

        let validator = self
            .validators
            .iter()
            .find(|v| v.address == sender)
            .expect("sender membership already checked in handle()")
            .clone();

        let seal_msg = committed_seal_message(&data.subject.digest, view.round);
        let seal_sig = match BlsSignature::from_bytes(&data.committed_seal) {
            Ok(sig) => sig,
            Err(e) => return Outcome::Rejected(ConsensusError::CryptoRejected(e)),
        };
        if ibft_crypto::verify(&validator.bls_public_key, &seal_msg, &[], &seal_sig, false, self.fork).is_err() {
            return Outcome::Rejected(ConsensusError::CryptoRejected(CryptoError::VerificationFailed));
        }

        let mut tau: Option<Vec<u8>> = None;
        if self.config.is_epoch_boundary(self.sequence) {
            if !data.epoch_validator_set_seal.is_empty() {
                let next_validators = self.chain.next_block_validators(&data.subject.digest);
                let epoch_data = epoch::epoch_snark_data(
                    &next_validators,
                    self.config.max_non_signers,
                    self.config.max_validators,
                    self.sequence.0,
                    view.round.0 as u8,
                    &data.subject.digest,
                    &self.parent_digest,
                );
                match epoch::verify_epoch_seal(
                    &validator.bls_public_key,
                    &epoch_data,
                    &data.epoch_validator_set_seal,
                    self.fork,
                ) {
                    Ok(()) => tau = Some(data.epoch_validator_set_seal.clone()),
                    Err(e) => return Outcome::Rejected(e),
                }
            }
        } else if !data.epoch_validator_set_seal.is_empty() {
            trace!("{:?} at sequence {}: {}", sender, self.sequence, ConsensusError::NotLastBlockInEpoch);
        }

        let subject = match self.round_state.subject {
            Some(s) => s,
            None => {
                self.backlog.insert(sender, view, SignedMessage {
                    envelope,
                    payload: Payload::Commit(data),
                });
                return Outcome::Backlogged;
            }
        };
        if data.subject.digest != subject.digest {
            return Outcome::Rejected(ConsensusError::InconsistentSubject(
                format!("{:x?}", data.subject.digest),
                format!("{:x?}", subject.digest),
            ));
        }

        let forwarded_envelope = envelope.clone();
        let inserted = self.round_state.record_commit(sender, SignedMessage {
            envelope,
            payload: Payload::Commit(data),
        });
        if inserted {
            if let Some(tau) = tau {
                self.epoch_taus.insert(sender, tau);
            }
            self.maybe_finalize();
            self.maybe_advance_to_prepared();
        }
        self.maybe_forward(sender, view, forwarded_envelope);
        Outcome::Accepted
    }

    /// Accepts a Commit for the *previous* sequence's already-finalized
    /// subject into the `ParentCommit` set (spec §4.4); any other
    /// strictly-old commit is just stale.
    fn handle_old_commit(&mut self, sender: Address, data: CommittedSubject) -> Outcome {
        let view = data.subject.view;
        let is_parent_commit = match self.last_finalized {
            Some((seq, digest, _)) => view.sequence == seq && data.subject.digest == digest,
            None => false,
        };
        if !is_parent_commit {
            return Outcome::Rejected(ConsensusError::OldMessage);
        }
        let previous_validators = match &self.previous_validators {
            Some(v) => v,
            None => return Outcome::Rejected(ConsensusError::OldMessage),
        };
        let validator = match previous_validators.iter().find(|v| v.address == sender) {
            Some(v) => v.clone(),
            None => return Outcome::Rejected(ConsensusError::InvalidValidator),
        };
        let seal_msg = committed_seal_message(&data.subject.digest, view.round);
        let sig = match BlsSignature::from_bytes(&data.committed_seal) {
            Ok(sig) => sig,
            Err(e) => return Outcome::Rejected(ConsensusError::CryptoRejected(e)),
        };
        if ibft_crypto::verify(&validator.bls_public_key, &seal_msg, &[], &sig, false, self.fork).is_err() {
            return Outcome::Rejected(ConsensusError::CryptoRejected(CryptoError::VerificationFailed));
        }
        self.parent_commits.entry(sender).or_insert(data.committed_seal);
        self.parent_commit_round.get_or_insert(view.round);
        Outcome::Accepted
    }

    fn maybe_finalize(&mut self) {
        if self.round_state.phase < Phase::Committed && self.round_state.commit_count() >= self.validators.quorum() {
            self.finalize();
        }
    }

    fn finalize(&mut self) {
        let subject = self.round_state.subject.expect("commit quorum implies an accepted subject");

        let mut bitmap = BitVec::from_elem(self.validators.n(), false);
        let mut sigs = Vec::new();
        let mut finished_commits: BTreeMap<Address, Vec<u8>> = BTreeMap::new();
        for (addr, signed) in self.round_state.commits() {
            if let Payload::Commit(c) = &signed.payload {
                if let Some(idx) = self.validators.index_of(addr) {
                    if let Ok(sig) = BlsSignature::from_bytes(&c.committed_seal) {
                        bitmap.set(idx, true);
                        sigs.push(sig);
                    }
                }
                finished_commits.insert(*addr, c.committed_seal.clone());
            }
        }
        let aggregated_signature = ibft_crypto::aggregate_signatures(&sigs)
            .expect("a commit quorum yields at least one valid committed seal");
        let aggregated_seal = AggregatedSeal {
            signer_bitmap: bitmap,
            signature: aggregated_signature.to_bytes(),
            round: subject.view.round,
        };

        let epoch_validator_set_seal = if self.config.is_epoch_boundary(self.sequence) {
            let next_validators = self.chain.next_block_validators(&subject.digest);
            let signers: Vec<(Address, Vec<u8>)> = self
                .epoch_taus
                .iter()
                .map(|(a, t)| (*a, t.clone()))
                .collect();
            epoch::aggregate_epoch_seal(&signers, &next_validators)
                .unwrap_or_else(|_| EpochValidatorSetSeal::empty(next_validators.n()))
        } else {
            EpochValidatorSetSeal::empty(self.validators.n())
        };

        self.parent_commits = finished_commits;
        self.parent_commit_round = Some(subject.view.round);

        self.round_state.phase = Phase::Committed;
        self.timer.cancel();
        self.forwarded.reset();
        self.round_change_votes.clear();
        self.last_finalized = Some((self.sequence, subject.digest, subject.view.round));

        self.chain.on_finalized(FinalizedBlock {
            sequence: self.sequence,
            digest: subject.digest,
            round: subject.view.round,
            aggregated_seal,
            epoch_validator_set_seal,
        });
    }

    fn validate_prepared_certificate(&self, cert: &PreparedCertificate) -> bool {
        if cert.prepares.len() < self.validators.quorum() {
            return false;
        }
        let mut seen = std::collections::BTreeSet::new();
        for envelope in &cert.prepares {
            let signed = match SignedMessage::decode(envelope.clone()) {
                Ok(s) => s,
                Err(_) => return false,
            };
            let prepare = match signed.payload {
                Payload::Prepare(p) => p,
                _ => return false,
            };
            if prepare.view != cert.subject.view || prepare.digest != cert.subject.digest {
                return false;
            }
            if !self.validators.contains(&signed.sender()) {
                return false;
            }
            if !seen.insert(signed.sender()) {
                return false;
            }
        }
        true
    }

    /// Fired by the embedder when the round timeout requested via
    /// `take_pending_timer` elapses. Stale (superseded) generations are
    /// ignored (spec §4.3, §5).
    pub fn on_timeout(&mut self, generation: u64) {
        if !self.timer.is_current(generation) {
            trace!("ignoring stale timeout generation {}", generation);
            return;
        }
        let next_round = self.round.next();
        let justification = self.preferred.as_ref().map(|(_, cert)| cert.clone());
        self.advance_round(next_round, justification, true);
    }

    fn handle_round_change(&mut self, sender: Address, data: RoundChangeData, envelope: Envelope) -> Outcome {
        if data.target_round <= self.round {
            return Outcome::Rejected(ConsensusError::OldMessage);
        }
        if let Some(cert) = &data.justification {
            if !self.validate_prepared_certificate(cert) {
                return Outcome::Rejected(ConsensusError::MissingJustification);
            }
        }
        let target_round = data.target_round;
        let view = View::new(self.sequence, target_round);
        let votes = self.round_change_votes.entry(target_round).or_default();
        if votes.insert(sender, data).is_some() {
            return Outcome::Accepted;
        }
        let quorum = self.validators.quorum();
        if self.round_change_votes[&target_round].len() >= quorum {
            let justification = self.round_change_votes[&target_round]
                .values()
                .filter_map(|v| v.justification.clone())
                .max_by_key(|cert| cert.subject.view.round);
            self.advance_round(target_round, justification, false);
        }
        self.maybe_forward(sender, view, envelope);
        Outcome::Accepted
    }

    /// Jumps the round forward (spec §4.3), either on local timeout or on
    /// observing a round-change quorum. `broadcast_own_vote` distinguishes
    /// the two: a timeout always announces its own round-change vote; a
    /// quorum-driven jump does not need to (the quorum already happened).
    fn advance_round(&mut self, round: Round, justification: Option<PreparedCertificate>, broadcast_own_vote: bool) {
        if round <= self.round {
            return;
        }
        self.round = round;
        self.round_state = RoundState::new(View::new(self.sequence, round));
        if let Some(cert) = justification {
            let is_newer = self.preferred.as_ref().map_or(true, |(r, _)| cert.subject.view.round > *r);
            if is_newer {
                self.preferred = Some((round, cert));
            }
        }
        self.round_change_votes.retain(|r, _| *r >= round);

        let req = self.timer.request(self.current_view(), &self.config);
        self.pending_timer = Some(req);

        if broadcast_own_vote {
            let our_justification = self.preferred.as_ref().map(|(_, cert)| cert.clone());
            let payload = Payload::RoundChange(RoundChangeData {
                target_round: round,
                justification: our_justification,
            });
            let envelope = Envelope::sign(&payload, &self.our_signing_key);
            if let Payload::RoundChange(d) = &payload {
                self.round_change_votes
                    .entry(round)
                    .or_default()
                    .insert(self.our_address, d.clone());
            }
            self.emit_multicast(MessageCode::RoundChange, &envelope, false);
        }

        self.drain_backlog();
    }

    fn drain_backlog(&mut self) {
        let view = self.current_view();
        let matched = self.backlog.drain_matching(view);
        for msg in matched {
            let outcome = self.handle(msg);
            if !outcome.is_accepted() {
                warn!("backlog replay did not result in acceptance: {:?}", outcome);
            }
        }
    }
}
