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

//! The 20-byte validator address derived from an ECDSA public key, in the
//! Ethereum/Istanbul convention the wire envelope (spec §6) uses.

use std::fmt;

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// A validator's on-chain address: the low 20 bytes of `keccak256` of the
/// uncompressed (x, y) encoding of its secp256k1 public key.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_public_key(pk: &PublicKey) -> Self {
        let uncompressed = pk.serialize_uncompressed();
        // Drop the leading 0x04 tag before hashing, matching how Ethereum
        // addresses are derived from the raw (x, y) coordinates.
        let hash = Keccak256::digest(&uncompressed[1..]);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash[12..]);
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Encodable for Address {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl Decodable for Address {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        let bytes: Vec<u8> = rlp.decoder().decode_value(|bytes| Ok(bytes.to_vec()))?;
        if bytes.len() != 20 {
            return Err(DecoderError::Custom("address must be 20 bytes"));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Secp256k1, SecretKey};

    #[test]
    fn address_is_deterministic() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        let a = Address::from_public_key(&pk);
        let b = Address::from_public_key(&pk);
        assert_eq!(a, b);
    }
}
