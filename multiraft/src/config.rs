//! Engine runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;

/// The runtime configuration for a multiraft node.
///
/// A new election is called for a group when its election timeout elapses
/// with no contact from the leader. The actual timeout is chosen randomly
/// from the range `[election_timeout_min, election_timeout_max)` to minimize
/// the chances of several nodes campaigning simultaneously. The Raft paper
/// suggests a range of 150-300ms for local networks; geographically
/// distributed installations should use higher values to account for the
/// increased round trip time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// If `true`, invariant violations panic instead of being logged, and
    /// additional sanity checks are performed.
    pub strict: bool,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    pub fn build() -> ConfigBuilder {
        ConfigBuilder {
            election_timeout_min: None,
            election_timeout_max: None,
            strict: false,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        if self.election_timeout_min == self.election_timeout_max {
            return self.election_timeout_min;
        }
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder to ensure that the runtime config is valid.
///
/// For election timeout configuration it is recommended that §5.6 of the
/// Raft spec is considered in order to set appropriate values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigBuilder {
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: Option<u64>,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: Option<u64>,
    /// Whether warnings are treated as fatal.
    pub strict: bool,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `strict`.
    pub fn strict(mut self, val: bool) -> Self {
        self.strict = val;
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min == 0 || election_timeout_max == 0 {
            return Err(ConfigError::InvalidElectionTimeout);
        }
        if election_timeout_min > election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeout);
        }
        Ok(Config {
            election_timeout_min,
            election_timeout_max,
            strict: self.strict,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build().validate().unwrap();

        assert_eq!(cfg.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(cfg.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert!(!cfg.strict);
    }

    #[test]
    fn test_config_with_specified_values() {
        let cfg = Config::build()
            .election_timeout_min(100)
            .election_timeout_max(200)
            .strict(true)
            .validate()
            .unwrap();

        assert_eq!(cfg.election_timeout_min, 100);
        assert_eq!(cfg.election_timeout_max, 200);
        assert!(cfg.strict);
    }

    #[test]
    fn test_invalid_election_timeout_config_produces_expected_error() {
        let res = Config::build().election_timeout_min(1000).election_timeout_max(700).validate();
        assert!(res.is_err());
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeout);

        let res = Config::build().election_timeout_min(0).election_timeout_max(0).validate();
        assert!(res.is_err());
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeout);
    }

    #[test]
    fn test_rand_election_timeout_within_range() {
        let cfg = Config::build().election_timeout_min(10).election_timeout_max(20).validate().unwrap();
        for _ in 0..100 {
            let timeout = cfg.new_rand_election_timeout();
            assert!((10..20).contains(&timeout), "timeout {} out of range", timeout);
        }
    }

    #[test]
    fn test_rand_election_timeout_degenerate_range() {
        let cfg = Config::build().election_timeout_min(5).election_timeout_max(5).validate().unwrap();
        assert_eq!(cfg.new_rand_election_timeout(), 5);
    }
}
