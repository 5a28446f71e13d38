use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Token-bucket parameters applied to a write buffer's ingestion path.
/// `rate` is in tokens per second; one token corresponds to one ingested
/// byte by convention at the call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub burst: u64,
    pub rate: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBufferConfig {
    pub key_len_max: usize,
    pub value_len_max: usize,
    /// When set, `WriteBuffer::open` builds a `TokenBucket` for ingestion
    /// callers to consult. The write path itself never blocks on it.
    pub throttle: Option<ThrottleConfig>,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            key_len_max: 1344,
            value_len_max: 1024 * 1024,
            throttle: None,
        }
    }
}

impl WriteBufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.key_len_max == 0 {
            return Err(Error::InvalidConfiguration(
                "key_len_max must be nonzero".into(),
            ));
        }
        if self.value_len_max == 0 {
            return Err(Error::InvalidConfiguration(
                "value_len_max must be nonzero".into(),
            ));
        }
        if let Some(throttle) = &self.throttle {
            if throttle.rate == 0 {
                return Err(Error::InvalidConfiguration(
                    "throttle rate must be nonzero".into(),
                ));
            }
        }
        Ok(())
    }
}
