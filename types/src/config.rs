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

//! The replica's static configuration, following the shape of `exonum`'s
//! `ConsensusConfig`/`GenesisConfig`: a `serde`-derived, eagerly-validated
//! value rather than something read lazily during the event loop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that make a [`ConsensusConfig`] unusable. Surfaced as the
/// `FatalConfig` error kind (spec §7) — callers are expected to abort
/// startup rather than attempt to run with an invalid configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("round timeout base must be positive")]
    ZeroTimeoutBase,
    #[error("round timeout growth factor must be at least 1.0")]
    InvalidGrowthFactor,
    #[error("round timeout cap must not be smaller than the base")]
    CapBelowBase,
    #[error("epoch length must be positive")]
    ZeroEpochLength,
    #[error("backlog capacity per sender must be positive")]
    ZeroBacklogCapacity,
    #[error("max_validators must not exceed the protocol ceiling of {0}")]
    MaxValidatorsTooLarge(usize),
}

/// Static, epoch-independent consensus configuration. Validated eagerly at
/// construction (`ConsensusConfig::new`) rather than checked piecemeal
/// during the event loop, mirroring `exonum::blockchain::ConsensusConfig`'s
/// `ValidateInput` pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Base duration, in milliseconds, of the round-0 timeout for a fresh
    /// sequence.
    pub round_timeout_base_ms: u64,
    /// Multiplicative growth factor applied to the timeout on each round
    /// advance (spec §4.3: "the deadline grows with each round advance,
    /// geometric, capped").
    pub round_timeout_growth: f64,
    /// Upper bound on the round timeout, regardless of how many rounds have
    /// elapsed.
    pub round_timeout_cap_ms: u64,
    /// Number of blocks per epoch; a sequence `S` is an epoch boundary when
    /// `S % epoch_length == 0`.
    pub epoch_length: u64,
    /// Maximum number of backlogged messages retained per sender (spec
    /// §4.2): oldest entries are evicted on overflow.
    pub backlog_capacity_per_sender: usize,
    /// `maxValidators` used when padding epoch-SNARK data (spec §4.4/§4.5).
    /// Must not exceed [`ibft_crypto::MAX_VALIDATORS`].
    pub max_validators: usize,
    /// `maxNonSigners` passed through to `EncodeEpochSnarkDataCIP22`.
    pub max_non_signers: u32,
    /// How many future rounds/sequences beyond the current view a message
    /// may claim before being dropped outright instead of backlogged (spec
    /// §7, `FutureMessage`: "within a bounded horizon").
    pub future_message_horizon: u64,
}

impl ConsensusConfig {
    pub fn new(
        round_timeout_base_ms: u64,
        round_timeout_growth: f64,
        round_timeout_cap_ms: u64,
        epoch_length: u64,
        backlog_capacity_per_sender: usize,
        max_validators: usize,
        max_non_signers: u32,
        future_message_horizon: u64,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            round_timeout_base_ms,
            round_timeout_growth,
            round_timeout_cap_ms,
            epoch_length,
            backlog_capacity_per_sender,
            max_validators,
            max_non_signers,
            future_message_horizon,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.round_timeout_base_ms == 0 {
            return Err(ConfigError::ZeroTimeoutBase);
        }
        if self.round_timeout_growth < 1.0 {
            return Err(ConfigError::InvalidGrowthFactor);
        }
        if self.round_timeout_cap_ms < self.round_timeout_base_ms {
            return Err(ConfigError::CapBelowBase);
        }
        if self.epoch_length == 0 {
            return Err(ConfigError::ZeroEpochLength);
        }
        if self.backlog_capacity_per_sender == 0 {
            return Err(ConfigError::ZeroBacklogCapacity);
        }
        if self.max_validators > ibft_crypto::MAX_VALIDATORS {
            return Err(ConfigError::MaxValidatorsTooLarge(ibft_crypto::MAX_VALIDATORS));
        }
        Ok(())
    }

    /// The round timeout for a given in-sequence round, per the geometric
    /// growth-capped rule of spec §4.3.
    pub fn round_timeout_ms(&self, round: crate::view::Round) -> u64 {
        let scaled = self.round_timeout_base_ms as f64 * self.round_timeout_growth.powi(round.0 as i32);
        (scaled as u64).min(self.round_timeout_cap_ms)
    }

    pub fn is_epoch_boundary(&self, sequence: crate::view::Sequence) -> bool {
        sequence.0 != 0 && sequence.0 % self.epoch_length == 0
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self::new(1_000, 1.5, 60_000, 30_000, 256, 150, 0, 10)
            .expect("default consensus configuration is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{Round, Sequence};

    #[test]
    fn default_config_validates() {
        ConsensusConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_timeout_base_rejected() {
        assert_eq!(
            ConsensusConfig::new(0, 1.5, 1000, 100, 4, 150, 0, 10).unwrap_err(),
            ConfigError::ZeroTimeoutBase
        );
    }

    #[test]
    fn timeout_grows_and_caps() {
        let config = ConsensusConfig::new(1000, 2.0, 5000, 100, 4, 150, 0, 10).unwrap();
        assert_eq!(config.round_timeout_ms(Round(0)), 1000);
        assert_eq!(config.round_timeout_ms(Round(1)), 2000);
        assert_eq!(config.round_timeout_ms(Round(10)), 5000);
    }

    #[test]
    fn epoch_boundary_detection() {
        let config = ConsensusConfig::new(1000, 1.5, 5000, 10, 4, 150, 0, 10).unwrap();
        assert!(config.is_epoch_boundary(Sequence(10)));
        assert!(config.is_epoch_boundary(Sequence(20)));
        assert!(!config.is_epoch_boundary(Sequence(0)));
        assert!(!config.is_epoch_boundary(Sequence(15)));
    }
}
