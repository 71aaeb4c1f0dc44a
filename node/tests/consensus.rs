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

//! A single-process sandbox for the replica state machine, in the style of
//! `exonum-node`'s `sandbox` crate: a small fixed validator set, each with
//! its own `Replica`, wired together by draining `Effect`s from one replica
//! and feeding them straight into its peers' `handle`, with no real network
//! or clock in between.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use secp256k1::{PublicKey as EcdsaPublicKey, Secp256k1, SecretKey as EcdsaSecretKey};

use ibft_crypto::{ForkContext, SecretKey as BlsSecretKey, Signature as BlsSignature};
use ibft_network::{Effect, ForwardKey};
use ibft_node::{ChainInterface, FinalizedBlock, Phase, Replica};
use ibft_types::{
    Address, CommittedSubject, ConsensusConfig, Digest, Envelope, MessageCode, Payload, Round,
    Sequence, SignedMessage, Subject, ValidatorDescriptor, ValidatorSet, View,
};

#[derive(Default)]
struct Ledger {
    blocks: BTreeMap<Sequence, Digest>,
}

struct TestChain {
    bls_sk: BlsSecretKey,
    ledger: Rc<RefCell<Ledger>>,
    next_validators: ValidatorSet,
}

impl ChainInterface for TestChain {
    fn next_block_validators(&self, _proposal_digest: &Digest) -> ValidatorSet {
        self.next_validators.clone()
    }

    fn hash_for_block(&self, sequence: Sequence) -> Option<Digest> {
        self.ledger.borrow().blocks.get(&sequence).copied()
    }

    fn sign_bls(&self, msg: &[u8], extra_data: &[u8], use_composite: bool, fork: ForkContext) -> BlsSignature {
        ibft_crypto::sign(&self.bls_sk, msg, extra_data, use_composite, fork)
    }

    fn on_finalized(&mut self, finalized: FinalizedBlock) {
        self.ledger.borrow_mut().blocks.insert(finalized.sequence, finalized.digest);
    }
}

struct Network {
    replicas: Vec<Replica<TestChain>>,
    addresses: Vec<Address>,
    ecdsa_keys: Vec<EcdsaSecretKey>,
    bls_keys: Vec<BlsSecretKey>,
    validator_set: ValidatorSet,
}

impl Network {
    fn new(n: usize, fork: ForkContext, config: ConsensusConfig) -> Self {
        let ledger = Rc::new(RefCell::new(Ledger::default()));
        let secp = Secp256k1::new();

        let mut descriptors = Vec::with_capacity(n);
        let mut ecdsa_keys = Vec::with_capacity(n);
        let mut bls_keys = Vec::with_capacity(n);
        for i in 0..n {
            let seed = (i + 1) as u8;
            let ecdsa_sk = EcdsaSecretKey::from_slice(&[seed; 32]).unwrap();
            let ecdsa_pk = EcdsaPublicKey::from_secret_key(&secp, &ecdsa_sk);
            let address = Address::from_public_key(&ecdsa_pk);

            let mut ikm = [seed; 32];
            ikm[0] ^= 0x5a;
            let bls_sk = BlsSecretKey::from_bytes(&ikm).unwrap();

            descriptors.push(ValidatorDescriptor {
                address,
                bls_public_key: bls_sk.public_key(),
            });
            ecdsa_keys.push(ecdsa_sk);
            bls_keys.push(bls_sk);
        }

        let validator_set = ValidatorSet::new(descriptors);
        let addresses: Vec<Address> = validator_set.iter().map(|v| v.address).collect();

        let mut replicas = Vec::with_capacity(n);
        for i in 0..n {
            let chain = TestChain {
                bls_sk: bls_keys[i].clone(),
                ledger: ledger.clone(),
                next_validators: validator_set.clone(),
            };
            let mut replica = Replica::new(
                addresses[i],
                ecdsa_keys[i].clone(),
                config.clone(),
                fork,
                validator_set.clone(),
                chain,
            );
            let _ = replica.start(Sequence(1), validator_set.clone());
            replicas.push(replica);
        }

        Self {
            replicas,
            addresses,
            ecdsa_keys,
            bls_keys,
            validator_set,
        }
    }

    fn index_of(&self, addr: Address) -> usize {
        self.addresses.iter().position(|a| *a == addr).unwrap()
    }

    /// Drains whatever `replicas[from]` has queued and feeds every multicast
    /// target its payload, skipping anyone in `silent` (byzantine-silent or
    /// partitioned per SC-B).
    fn deliver_effects(&mut self, from: usize, silent: &[usize]) {
        let effects = self.replicas[from].drain_effects();
        for effect in effects {
            if let Effect::Multicast { to, payload, .. } = effect {
                let envelope: Envelope = rlp::decode(&payload).unwrap();
                for addr in to {
                    let idx = self.index_of(addr);
                    if silent.contains(&idx) {
                        continue;
                    }
                    let signed = SignedMessage::decode(envelope.clone()).unwrap();
                    let _ = self.replicas[idx].handle(signed);
                }
            }
        }
    }

    /// Runs a fixed-point relay of whatever's been queued until nothing new
    /// is produced (bounded, since a correct quorum converges in a handful
    /// of hops: PrePrepare -> Prepare -> Commit).
    fn relay(&mut self, silent: &[usize]) {
        for _ in 0..8 {
            for i in 0..self.replicas.len() {
                if silent.contains(&i) {
                    continue;
                }
                self.deliver_effects(i, silent);
            }
        }
    }

    fn propose_and_relay(&mut self, proposer_idx: usize, digest: Digest, silent: &[usize]) {
        if !silent.contains(&proposer_idx) {
            self.replicas[proposer_idx].propose(digest, vec![0xAA, 0xBB]).unwrap();
        }
        self.relay(silent);
    }

    fn fire_timeouts(&mut self, silent: &[usize]) {
        let mut generations = Vec::with_capacity(self.replicas.len());
        for (i, replica) in self.replicas.iter_mut().enumerate() {
            generations.push(if silent.contains(&i) {
                None
            } else {
                replica.take_pending_timer().map(|t| t.generation)
            });
        }
        for (i, generation) in generations.into_iter().enumerate() {
            if let Some(generation) = generation {
                self.replicas[i].on_timeout(generation);
            }
        }
        self.relay(silent);
    }
}

fn test_config() -> ConsensusConfig {
    let _ = env_logger::try_init();
    ConsensusConfig::new(50, 2.0, 5_000, 30, 16, 150, 0, 10).unwrap()
}

fn fork() -> ForkContext {
    ForkContext::new(1_000_000, 1)
}

// SC-A: four honest validators, no faults, one round, one sequence.
#[test]
fn happy_path_reaches_commit_in_one_round() {
    let config = test_config();
    let mut network = Network::new(4, fork(), config);
    let digest = [7u8; 32];
    let proposer = network.validator_set.proposer_index(Sequence(1), Round(0));
    network.propose_and_relay(proposer, digest, &[]);

    for replica in &network.replicas {
        assert_eq!(replica.sequence(), Sequence(1));
        assert_eq!(replica.phase(), Phase::Committed);
    }
}

// SC-B: one validator is byzantine-silent throughout. With n=4, q=3, the
// remaining three honest replicas still reach quorum and finalize.
#[test]
fn one_silent_validator_does_not_block_quorum() {
    let config = test_config();
    let mut network = Network::new(4, fork(), config);
    let digest = [9u8; 32];
    let silent = [3usize];
    let proposer = network.validator_set.proposer_index(Sequence(1), Round(0));
    assert!(!silent.contains(&proposer), "fixture assumes the proposer stays honest");
    network.propose_and_relay(proposer, digest, &silent);

    for (i, replica) in network.replicas.iter().enumerate() {
        if silent.contains(&i) {
            continue;
        }
        assert_eq!(replica.phase(), Phase::Committed, "replica {} should have finalized", i);
    }
}

// SC-C: the round-0 proposer is silenced, forcing every honest replica to
// time out, unilaterally advance its own round, and broadcast a round-change
// vote; consensus then completes in round 1 behind the new proposer.
#[test]
fn timeout_drives_round_change_and_eventual_commit() {
    let config = test_config();
    let mut network = Network::new(4, fork(), config);
    let digest = [3u8; 32];

    let round0_proposer = network.validator_set.proposer_index(Sequence(1), Round(0));
    let silent = [round0_proposer];

    network.fire_timeouts(&silent);

    for (i, replica) in network.replicas.iter().enumerate() {
        if !silent.contains(&i) {
            assert_eq!(replica.round(), Round(1));
        }
    }

    let round1_proposer = network.validator_set.proposer_index(Sequence(1), Round(1));
    assert!(!silent.contains(&round1_proposer), "round-robin rotation must pick a different proposer");
    network.propose_and_relay(round1_proposer, digest, &silent);

    for (i, replica) in network.replicas.iter().enumerate() {
        if silent.contains(&i) {
            continue;
        }
        assert_eq!(replica.phase(), Phase::Committed);
        assert_eq!(replica.round(), Round(1));
    }
}

// SC-D: a commit for the already-finalized previous sequence arrives after
// the replica has moved on to the next sequence; it is folded into the
// `ParentCommit` set instead of being rejected as stale, and the next
// `start()` call turns it into a non-empty `ParentAggregatedSeal`.
#[test]
fn late_commit_for_finalized_sequence_becomes_a_parent_commit() {
    let config = test_config();
    let mut network = Network::new(4, fork(), config);
    let digest = [1u8; 32];
    let proposer = network.validator_set.proposer_index(Sequence(1), Round(0));
    network.propose_and_relay(proposer, digest, &[]);

    for replica in &network.replicas {
        assert_eq!(replica.phase(), Phase::Committed);
    }

    let validator_set = network.validator_set.clone();
    for replica in network.replicas.iter_mut() {
        let parent_seal = replica.start(Sequence(2), validator_set.clone());
        assert!(
            parent_seal.is_some(),
            "a commit quorum at sequence 1 must produce a non-empty parent aggregated seal at sequence 2"
        );
    }

    // Validator 3's own Commit for sequence 1 arrives late, after everyone
    // has already advanced past it.
    let late_sender = 3usize;
    let late_view = View::new(Sequence(1), Round(0));
    let mut seal_msg = Vec::with_capacity(40);
    seal_msg.extend_from_slice(&digest);
    seal_msg.extend_from_slice(&0u64.to_be_bytes());
    let late_committed_seal = ibft_crypto::sign(&network.bls_keys[late_sender], &seal_msg, &[], false, fork()).to_bytes();

    let late_payload = Payload::Commit(CommittedSubject {
        subject: Subject::new(late_view, digest),
        committed_seal: late_committed_seal,
        epoch_validator_set_seal: Vec::new(),
    });
    let late_envelope = Envelope::sign(&late_payload, &network.ecdsa_keys[late_sender]);
    let late_msg = SignedMessage::decode(late_envelope).unwrap();

    let outcome = network.replicas[0].handle(late_msg);
    assert!(outcome.is_accepted(), "a late commit matching the finalized parent subject must be accepted");
}

// SC-E: at an epoch-boundary sequence, the commit quorum still reaches
// finality (the per-validator `τ` contributions aggregate into the epoch
// seal assembled inside `finalize`).
#[test]
fn epoch_boundary_sequence_still_reaches_commit() {
    let config = ConsensusConfig::new(50, 2.0, 5_000, 1, 16, 150, 0, 10).unwrap();
    let mut network = Network::new(4, fork(), config);
    let digest = [4u8; 32];
    let proposer = network.validator_set.proposer_index(Sequence(1), Round(0));
    network.propose_and_relay(proposer, digest, &[]);

    for replica in &network.replicas {
        assert_eq!(replica.phase(), Phase::Committed);
    }
}

// Property: applying the same message twice leaves the outcome (and thus
// the observable state) unchanged.
#[test]
fn handling_a_duplicate_message_is_idempotent() {
    let config = test_config();
    let mut network = Network::new(4, fork(), config);
    let digest = [5u8; 32];
    let proposer = network.validator_set.proposer_index(Sequence(1), Round(0));

    network.replicas[proposer].propose(digest, vec![1]).unwrap();
    let effects = network.replicas[proposer].drain_effects();
    let mut prepare_envelope = None;
    for effect in effects {
        if let Effect::Multicast { code, payload, .. } = effect {
            if code == MessageCode::Prepare {
                prepare_envelope = Some(rlp::decode::<Envelope>(&payload).unwrap());
            }
        }
    }
    let envelope = prepare_envelope.expect("proposer must have broadcast its own Prepare");
    let target = (proposer + 1) % 4;

    let first = network.replicas[target].handle(SignedMessage::decode(envelope.clone()).unwrap());
    let second = network.replicas[target].handle(SignedMessage::decode(envelope).unwrap());
    assert!(first.is_accepted());
    assert!(second.is_accepted());
}

// Property: a peer that never receives a Prepare directly still ends up
// accepting it once another validator, having received it, re-broadcasts it
// wrapped in a `Forward` envelope (spec §4.6).
#[test]
fn forwarded_message_reaches_a_peer_that_never_saw_the_original() {
    let config = test_config();
    let mut network = Network::new(4, fork(), config);
    let digest = [2u8; 32];
    let proposer = network.validator_set.proposer_index(Sequence(1), Round(0));
    let relayer = (proposer + 1) % 4;
    let isolated = (proposer + 2) % 4;

    network.replicas[proposer].propose(digest, vec![0x01]).unwrap();
    let effects = network.replicas[proposer].drain_effects();

    // Hand the proposer's PrePrepare to `relayer` only; `isolated` never sees
    // it directly.
    for effect in effects {
        if let Effect::Multicast { to, payload, .. } = effect {
            let envelope: Envelope = rlp::decode(&payload).unwrap();
            if to.contains(&network.addresses[relayer]) {
                let signed = SignedMessage::decode(envelope).unwrap();
                let outcome = network.replicas[relayer].handle(signed);
                assert!(outcome.is_accepted());
            }
        }
    }
    assert_eq!(network.replicas[isolated].phase(), Phase::AcceptRequest);

    // `relayer` now re-broadcasts the PrePrepare wrapped in a Forward
    // envelope; feed only that one to `isolated`.
    let relayer_effects = network.replicas[relayer].drain_effects();
    let mut forward_envelope = None;
    for effect in relayer_effects {
        if let Effect::Multicast { code, to, payload, .. } = effect {
            if code == MessageCode::Forward && to.contains(&network.addresses[isolated]) {
                forward_envelope = Some(rlp::decode::<Envelope>(&payload).unwrap());
            }
        }
    }
    let forward_envelope = forward_envelope.expect("relayer must forward the PrePrepare it did not originate");
    let signed_forward = SignedMessage::decode(forward_envelope).unwrap();
    let outcome = network.replicas[isolated].handle(signed_forward);
    assert!(outcome.is_accepted());
    assert_eq!(network.replicas[isolated].phase(), Phase::Preprepared);
}

// Property: a replica's own `ForwardedSet` is reset exactly once finality is
// reached, so dedup state never leaks across sequences (spec §4.6, §9).
#[test]
fn forwarded_set_resets_on_finalize() {
    let config = test_config();
    let mut network = Network::new(4, fork(), config);
    let digest = [6u8; 32];
    let proposer = network.validator_set.proposer_index(Sequence(1), Round(0));

    let watched = (proposer + 1) % 4;
    {
        let forwarded = network.replicas[watched].forwarded_set_mut();
        let key = ForwardKey::new(MessageCode::Commit, network.addresses[proposer], View::new(Sequence(1), Round(0)));
        assert!(forwarded.should_forward(key));
    }

    network.propose_and_relay(proposer, digest, &[]);
    assert_eq!(network.replicas[watched].phase(), Phase::Committed);
    assert!(network.replicas[watched].forwarded_set_mut().is_empty());
}

// SC-F: the same Commit reaches a replica twice (once direct, once via a
// forwarding peer). Only the first delivery changes anything; the second
// is accepted but inserts nothing new and triggers no further effect.
#[test]
fn duplicate_commit_arriving_via_two_peers_changes_state_once() {
    let config = test_config();
    let mut network = Network::new(4, fork(), config);
    let digest = [8u8; 32];
    let proposer = network.validator_set.proposer_index(Sequence(1), Round(0));
    let sender = (proposer + 1) % 4;
    let target = (proposer + 2) % 4;

    // `sender`'s own messages never circulate through the relay; the other
    // three validators (proposer, target, and the fourth) still reach a
    // commit quorum among themselves (q=3 of n=4).
    network.replicas[proposer].propose(digest, vec![0xAA]).unwrap();
    network.relay(&[sender]);
    assert_eq!(network.replicas[target].phase(), Phase::Committed);
    let commit_count_before = network.replicas[target].commit_count();

    let view = View::new(Sequence(1), Round(0));
    let seal_msg = {
        let mut m = Vec::with_capacity(40);
        m.extend_from_slice(&digest);
        m.extend_from_slice(&0u64.to_be_bytes());
        m
    };
    let committed_seal = ibft_crypto::sign(&network.bls_keys[sender], &seal_msg, &[], false, fork()).to_bytes();
    let payload = Payload::Commit(CommittedSubject {
        subject: Subject::new(view, digest),
        committed_seal,
        epoch_validator_set_seal: Vec::new(),
    });
    let envelope = Envelope::sign(&payload, &network.ecdsa_keys[sender]);

    let first = network.replicas[target].handle(SignedMessage::decode(envelope.clone()).unwrap());
    let commit_count_after_first = network.replicas[target].commit_count();

    // The identical Commit arrives a second time, forwarded by a different
    // peer than the original sender.
    let second = network.replicas[target].handle(SignedMessage::decode(envelope).unwrap());
    let commit_count_after_second = network.replicas[target].commit_count();

    assert!(first.is_accepted());
    assert!(second.is_accepted());
    assert_eq!(
        commit_count_after_first,
        commit_count_before + 1,
        "the first delivery of sender's Commit must be newly recorded"
    );
    assert_eq!(
        commit_count_after_first, commit_count_after_second,
        "a re-delivered Commit from the same sender must not be counted twice"
    );
}
