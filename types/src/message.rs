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

//! The consensus wire envelope (spec §6): an RLP-encoded outer frame with a
//! recoverable-ECDSA sender signature, carrying one of the four inner
//! message payloads.

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message as Secp256k1Message, PublicKey, Secp256k1, SecretKey};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::address::Address;
use crate::subject::Subject;
use crate::view::{Round, View};

/// Width of a serialized BLS public key in the protocol's "composite" G2
/// encoding (spec §6) — distinct from [`ibft_crypto::SERIALIZED_PUBLIC_KEY_LEN`]
/// only in name; both are 128 bytes. Kept here too so wire-message code
/// doesn't need to depend on `ibft-crypto` just for a constant.
pub const SERIALIZED_PUBLIC_KEY_LEN: usize = 128;
/// Width of the auxiliary G1 public key used by CIP22 composite signing.
pub const SERIALIZED_G1_PUBLIC_KEY_LEN: usize = 64;
/// Width of a serialized BLS signature.
pub const SERIALIZED_SIGNATURE_LEN: usize = 96;

/// The one-byte message discriminant carried in the envelope and used as
/// the RLPx subprotocol message code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageCode {
    PrePrepare = 0,
    Prepare = 1,
    Commit = 2,
    RoundChange = 3,
    Forward = 4,
}

impl MessageCode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::PrePrepare),
            1 => Some(Self::Prepare),
            2 => Some(Self::Commit),
            3 => Some(Self::RoundChange),
            4 => Some(Self::Forward),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("RLP decoding failed: {0}")]
    Rlp(String),
    #[error("unknown message code {0}")]
    UnknownCode(u8),
    #[error("envelope signature does not recover to the declared sender address")]
    SenderMismatch,
    #[error("envelope signature is malformed")]
    MalformedSignature,
}

impl From<DecoderError> for MessageError {
    fn from(e: DecoderError) -> Self {
        MessageError::Rlp(e.to_string())
    }
}

/// The `PrePrepare`/`Prepare` inner payload (spec §6). `proposal` is only
/// populated for `PrePrepare`; `justification` carries the prepared
/// certificate a `PrePrepare` must attach when switching subjects across
/// rounds of the same sequence (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrePrepareData {
    pub view: View,
    pub digest: [u8; 32],
    pub proposal: Vec<u8>,
    /// Digest of the parent block this proposal extends (spec §3: a
    /// `Proposal` is opaque to the state machine except for `H`, `S`, and
    /// parent linkage — this is that linkage).
    pub parent_digest: [u8; 32],
    pub justification: Option<PreparedCertificate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareData {
    pub view: View,
    pub digest: [u8; 32],
}

/// `(Subject, committedSeal, epochValidatorSetSeal)` — the Commit inner
/// payload (spec §3, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedSubject {
    pub subject: Subject,
    pub committed_seal: Vec<u8>,
    pub epoch_validator_set_seal: Vec<u8>,
}

/// The round-change inner payload. Resolution of the spec's Open Question
/// ("does RoundChange carry the highest prepared certificate explicitly"):
/// yes — see `DESIGN.md`. A round-change with no prior prepared evidence
/// carries `justification: None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundChangeData {
    pub target_round: Round,
    pub justification: Option<PreparedCertificate>,
}

/// The evidence a validator attaches to justify proposing (or round-changing
/// into) a subject other than a fresh one: the subject itself plus the `q`
/// `Prepare` envelopes that proved it prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCertificate {
    pub subject: Subject,
    pub prepares: Vec<Envelope>,
}

/// The `Forward` inner payload (spec §4.6, §6): a consensus envelope this
/// replica did not originate, re-wrapped and re-signed so it can be
/// relayed onward to peers that may not have received it directly. The
/// inner envelope's own signature is what authenticates its original
/// sender; the outer envelope only authenticates the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardData {
    pub inner: Box<Envelope>,
}

/// The decoded inner payload of a consensus message, tagged by its
/// `MessageCode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    PrePrepare(PrePrepareData),
    Prepare(PrepareData),
    Commit(CommittedSubject),
    RoundChange(RoundChangeData),
    Forward(ForwardData),
}

impl Payload {
    pub fn code(&self) -> MessageCode {
        match self {
            Payload::PrePrepare(_) => MessageCode::PrePrepare,
            Payload::Prepare(_) => MessageCode::Prepare,
            Payload::Commit(_) => MessageCode::Commit,
            Payload::RoundChange(_) => MessageCode::RoundChange,
            Payload::Forward(_) => MessageCode::Forward,
        }
    }
}

/// The outer wire frame (spec §6): `{ code, msgPayload, address, signature }`.
/// `signature` is a 65-byte recoverable ECDSA signature over
/// `keccak256(code || msgPayload)`; `address` is redundant with what the
/// signature recovers to, and is checked against it on decode so a forged
/// `address` field is rejected as `InvalidMessage` rather than silently
/// trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub code: MessageCode,
    pub payload_bytes: Vec<u8>,
    pub address: Address,
    pub signature: [u8; 65],
}

impl Envelope {
    fn signing_hash(code: MessageCode, payload_bytes: &[u8]) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update([code as u8]);
        hasher.update(payload_bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    /// Encodes `payload`, signs the envelope with `sk`, and derives the
    /// sender address from the signing key — the address a correct replica
    /// always presents is its own, so this constructor cannot produce a
    /// `SenderMismatch` envelope.
    pub fn sign(payload: &Payload, sk: &SecretKey) -> Self {
        let code = payload.code();
        let payload_bytes = encode_payload(payload);
        let hash = Self::signing_hash(code, &payload_bytes);
        let secp = Secp256k1::signing_only();
        let msg = Secp256k1Message::from_slice(&hash).expect("32-byte hash is a valid message");
        let (recovery_id, sig_bytes) = secp
            .sign_ecdsa_recoverable(&msg, sk)
            .serialize_compact();
        let mut signature = [0u8; 65];
        signature[..64].copy_from_slice(&sig_bytes);
        signature[64] = recovery_id.to_i32() as u8;

        let secp_verify = Secp256k1::verification_only();
        let pk = PublicKey::from_secret_key(
            &Secp256k1::new(),
            sk,
        );
        let _ = secp_verify; // context only used for symmetry with `verify_and_recover`
        let address = Address::from_public_key(&pk);

        Self {
            code,
            payload_bytes,
            address,
            signature,
        }
    }

    /// Recovers the sender's public key from the envelope signature and
    /// checks it matches the declared `address`. Returns the decoded
    /// `Payload` on success.
    pub fn verify_and_decode(&self) -> Result<Payload, MessageError> {
        let hash = Self::signing_hash(self.code, &self.payload_bytes);
        let msg = Secp256k1Message::from_slice(&hash).expect("32-byte hash is a valid message");
        let recovery_id = RecoveryId::from_i32(self.signature[64] as i32)
            .map_err(|_| MessageError::MalformedSignature)?;
        let recoverable = RecoverableSignature::from_compact(&self.signature[..64], recovery_id)
            .map_err(|_| MessageError::MalformedSignature)?;
        let secp = Secp256k1::verification_only();
        let pk = secp
            .recover_ecdsa(&msg, &recoverable)
            .map_err(|_| MessageError::MalformedSignature)?;
        let recovered = Address::from_public_key(&pk);
        if recovered != self.address {
            return Err(MessageError::SenderMismatch);
        }
        decode_payload(self.code, &self.payload_bytes)
    }

    pub fn view(&self) -> Option<View> {
        match decode_payload(self.code, &self.payload_bytes).ok()? {
            Payload::PrePrepare(d) => Some(d.view),
            Payload::Prepare(d) => Some(d.view),
            Payload::Commit(d) => Some(d.subject.view),
            Payload::RoundChange(_) => None,
            Payload::Forward(d) => d.inner.view(),
        }
    }
}

/// A `SignedMessage` is an envelope that has already passed
/// `verify_and_decode` — callers hold this type once the sender address is
/// authenticated, so `ibft-node` never has to re-verify the ECDSA signature
/// on every access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub envelope: Envelope,
    pub payload: Payload,
}

impl SignedMessage {
    pub fn decode(envelope: Envelope) -> Result<Self, MessageError> {
        let payload = envelope.verify_and_decode()?;
        Ok(Self { envelope, payload })
    }

    pub fn sender(&self) -> Address {
        self.envelope.address
    }
}

/// Encodes an optional [`PreparedCertificate`] as an opaque blob: empty
/// when absent, otherwise an RLP list of `[sequence, round, digest,
/// prepare-envelopes...]`.
fn encode_justification(justification: &Option<PreparedCertificate>) -> Vec<u8> {
    match justification {
        None => Vec::new(),
        Some(cert) => {
            let mut stream = RlpStream::new();
            stream.begin_list(4);
            stream.append(&cert.subject.view.sequence.0);
            stream.append(&cert.subject.view.round.0);
            stream.append(&cert.subject.digest.to_vec());
            stream.append_list(&cert.prepares);
            stream.out().to_vec()
        }
    }
}

fn decode_justification(bytes: &[u8]) -> Result<Option<PreparedCertificate>, MessageError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let rlp = Rlp::new(bytes);
    let sequence = rlp.val_at(0)?;
    let round = rlp.val_at(1)?;
    let digest_vec: Vec<u8> = rlp.val_at(2)?;
    if digest_vec.len() != 32 {
        return Err(MessageError::Rlp("digest must be 32 bytes".into()));
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&digest_vec);
    let prepares: Vec<Envelope> = rlp.list_at(3)?;
    Ok(Some(PreparedCertificate {
        subject: Subject::new(
            View::new(crate::view::Sequence(sequence), crate::view::Round(round)),
            digest,
        ),
        prepares,
    }))
}

fn encode_payload(payload: &Payload) -> Vec<u8> {
    let mut stream = RlpStream::new();
    match payload {
        Payload::PrePrepare(data) => {
            stream.begin_list(6);
            stream.append(&data.view.sequence.0);
            stream.append(&data.view.round.0);
            stream.append(&data.digest.to_vec());
            stream.append(&data.proposal);
            stream.append(&data.parent_digest.to_vec());
            stream.append(&encode_justification(&data.justification));
        }
        Payload::Prepare(data) => {
            stream.begin_list(3);
            stream.append(&data.view.sequence.0);
            stream.append(&data.view.round.0);
            stream.append(&data.digest.to_vec());
        }
        Payload::Commit(data) => {
            stream.begin_list(5);
            stream.append(&data.subject.view.sequence.0);
            stream.append(&data.subject.view.round.0);
            stream.append(&data.subject.digest.to_vec());
            stream.append(&data.committed_seal);
            stream.append(&data.epoch_validator_set_seal);
        }
        Payload::RoundChange(data) => {
            stream.begin_list(2);
            stream.append(&data.target_round.0);
            stream.append(&encode_justification(&data.justification));
        }
        Payload::Forward(data) => {
            stream.begin_list(1);
            stream.append(&rlp::encode(&*data.inner).to_vec());
        }
    }
    stream.out().to_vec()
}

fn decode_payload(code: MessageCode, bytes: &[u8]) -> Result<Payload, MessageError> {
    let rlp = Rlp::new(bytes);
    match code {
        MessageCode::PrePrepare => {
            let sequence = rlp.val_at(0)?;
            let round = rlp.val_at(1)?;
            let digest_vec: Vec<u8> = rlp.val_at(2)?;
            let proposal: Vec<u8> = rlp.val_at(3)?;
            let parent_digest_vec: Vec<u8> = rlp.val_at(4)?;
            let justification_bytes: Vec<u8> = rlp.val_at(5)?;
            let mut digest = [0u8; 32];
            if digest_vec.len() != 32 {
                return Err(MessageError::Rlp("digest must be 32 bytes".into()));
            }
            digest.copy_from_slice(&digest_vec);
            let mut parent_digest = [0u8; 32];
            if parent_digest_vec.len() != 32 {
                return Err(MessageError::Rlp("parent digest must be 32 bytes".into()));
            }
            parent_digest.copy_from_slice(&parent_digest_vec);
            Ok(Payload::PrePrepare(PrePrepareData {
                view: View::new(crate::view::Sequence(sequence), crate::view::Round(round)),
                digest,
                proposal,
                parent_digest,
                justification: decode_justification(&justification_bytes)?,
            }))
        }
        MessageCode::Prepare => {
            let sequence = rlp.val_at(0)?;
            let round = rlp.val_at(1)?;
            let digest_vec: Vec<u8> = rlp.val_at(2)?;
            let mut digest = [0u8; 32];
            if digest_vec.len() != 32 {
                return Err(MessageError::Rlp("digest must be 32 bytes".into()));
            }
            digest.copy_from_slice(&digest_vec);
            Ok(Payload::Prepare(PrepareData {
                view: View::new(crate::view::Sequence(sequence), crate::view::Round(round)),
                digest,
            }))
        }
        MessageCode::Commit => {
            let sequence = rlp.val_at(0)?;
            let round = rlp.val_at(1)?;
            let digest_vec: Vec<u8> = rlp.val_at(2)?;
            let committed_seal: Vec<u8> = rlp.val_at(3)?;
            let epoch_validator_set_seal: Vec<u8> = rlp.val_at(4)?;
            let mut digest = [0u8; 32];
            if digest_vec.len() != 32 {
                return Err(MessageError::Rlp("digest must be 32 bytes".into()));
            }
            digest.copy_from_slice(&digest_vec);
            Ok(Payload::Commit(CommittedSubject {
                subject: Subject::new(
                    View::new(crate::view::Sequence(sequence), crate::view::Round(round)),
                    digest,
                ),
                committed_seal,
                epoch_validator_set_seal,
            }))
        }
        MessageCode::RoundChange => {
            let target_round = rlp.val_at(0)?;
            let justification_bytes: Vec<u8> = rlp.val_at(1)?;
            Ok(Payload::RoundChange(RoundChangeData {
                target_round: crate::view::Round(target_round),
                justification: decode_justification(&justification_bytes)?,
            }))
        }
        MessageCode::Forward => {
            let inner_bytes: Vec<u8> = rlp.val_at(0)?;
            let inner: Envelope = rlp::decode(&inner_bytes)
                .map_err(|e: DecoderError| MessageError::Rlp(e.to_string()))?;
            Ok(Payload::Forward(ForwardData {
                inner: Box::new(inner),
            }))
        }
    }
}

impl Encodable for Envelope {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&(self.code as u8));
        s.append(&self.payload_bytes);
        s.append(&self.address);
        s.append(&self.signature.to_vec());
    }
}

impl Decodable for Envelope {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        let code_byte: u8 = rlp.val_at(0)?;
        let code = MessageCode::from_u8(code_byte)
            .ok_or_else(|| DecoderError::Custom("unknown message code"))?;
        let payload_bytes: Vec<u8> = rlp.val_at(1)?;
        let address: Address = rlp.val_at(2)?;
        let signature_vec: Vec<u8> = rlp.val_at(3)?;
        if signature_vec.len() != 65 {
            return Err(DecoderError::Custom("signature must be 65 bytes"));
        }
        let mut signature = [0u8; 65];
        signature.copy_from_slice(&signature_vec);
        Ok(Envelope {
            code,
            payload_bytes,
            address,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sk(seed: u8) -> SecretKey {
        SecretKey::from_slice(&[seed; 32]).unwrap()
    }

    #[test]
    fn sign_then_verify_recovers_sender() {
        let sk = sample_sk(11);
        let payload = Payload::Prepare(PrepareData {
            view: View::start_of(crate::view::Sequence(1)),
            digest: [9u8; 32],
        });
        let envelope = Envelope::sign(&payload, &sk);
        let decoded = envelope.verify_and_decode().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn tampered_address_is_rejected() {
        let sk = sample_sk(11);
        let other_sk = sample_sk(12);
        let payload = Payload::Prepare(PrepareData {
            view: View::start_of(crate::view::Sequence(1)),
            digest: [9u8; 32],
        });
        let mut envelope = Envelope::sign(&payload, &sk);
        let secp = Secp256k1::new();
        envelope.address = Address::from_public_key(&PublicKey::from_secret_key(&secp, &other_sk));
        assert_eq!(
            envelope.verify_and_decode().unwrap_err(),
            MessageError::SenderMismatch
        );
    }

    #[test]
    fn envelope_round_trips_through_rlp() {
        let sk = sample_sk(3);
        let payload = Payload::Commit(CommittedSubject {
            subject: Subject::new(View::start_of(crate::view::Sequence(5)), [4u8; 32]),
            committed_seal: vec![1, 2, 3],
            epoch_validator_set_seal: vec![],
        });
        let envelope = Envelope::sign(&payload, &sk);
        let bytes = rlp::encode(&envelope);
        let decoded: Envelope = rlp::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn forwarded_envelope_round_trips_and_recovers_the_original_sender() {
        let original_sk = sample_sk(21);
        let relay_sk = sample_sk(22);
        let inner_payload = Payload::Prepare(PrepareData {
            view: View::start_of(crate::view::Sequence(2)),
            digest: [6u8; 32],
        });
        let inner = Envelope::sign(&inner_payload, &original_sk);

        let forward_payload = Payload::Forward(ForwardData {
            inner: Box::new(inner.clone()),
        });
        let forward_envelope = Envelope::sign(&forward_payload, &relay_sk);

        let decoded = forward_envelope.verify_and_decode().unwrap();
        let Payload::Forward(data) = decoded else {
            panic!("expected a Forward payload");
        };
        assert_eq!(*data.inner, inner);

        // The relay's own signature authenticates the envelope it sent, but
        // the wrapped message still carries (and verifies under) the
        // original sender's signature.
        let original = data.inner.verify_and_decode().unwrap();
        assert_eq!(original, inner_payload);
    }
}
