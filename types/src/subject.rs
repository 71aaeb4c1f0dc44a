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

//! The subject under vote, and the aggregated certificates a commit quorum
//! produces.

use bit_vec::BitVec;
use serde::{Deserialize, Serialize};

use crate::view::View;

/// A 32-byte block digest.
pub type Digest = [u8; 32];

/// `(View, digest)`: the unit of voting. Two `Prepare`/`Commit` messages
/// agree iff their subjects are equal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub view: View,
    pub digest: Digest,
}

impl Subject {
    pub fn new(view: View, digest: Digest) -> Self {
        Self { view, digest }
    }
}

/// The aggregated committed-seal certificate attached to a finalized block:
/// a bitmap of which validator indices signed, plus their aggregated BLS
/// signature over `enc(digest || round)`.
#[derive(Debug, Clone)]
pub struct AggregatedSeal {
    pub signer_bitmap: BitVec,
    pub signature: Vec<u8>,
    pub round: crate::view::Round,
}

impl AggregatedSeal {
    pub fn signer_indices(&self) -> Vec<usize> {
        self.signer_bitmap
            .iter()
            .enumerate()
            .filter_map(|(i, bit)| bit.then_some(i))
            .collect()
    }
}

/// The epoch-boundary analogue of [`AggregatedSeal`]: the aggregated `τ`
/// signatures over the next epoch's epoch-SNARK data. Empty (zero signers)
/// on non-epoch-boundary blocks, per spec §4.5/§7 (`NotLastBlockInEpoch`).
#[derive(Debug, Clone)]
pub struct EpochValidatorSetSeal {
    pub signer_bitmap: BitVec,
    pub signature: Vec<u8>,
}

impl EpochValidatorSetSeal {
    pub fn empty(n: usize) -> Self {
        Self {
            signer_bitmap: BitVec::from_elem(n, false),
            signature: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signature.is_empty()
    }
}
