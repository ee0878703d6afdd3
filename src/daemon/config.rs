//! Lease daemon configuration.

use crate::utils::SectorlockError;

use rand::Rng;

use serde::Deserialize;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Name this host writes into the lockspace slots it claims. Must stay
    /// the same across restarts to rejoin without waiting.
    pub host_name: String,

    /// Renewal interval as a fraction of io_timeout.
    pub renewal_fraction: f64,

    /// Heartbeat lapse after which a session is reaped, in millisecs.
    pub session_timeout_ms: u64,

    /// Interval of the session reaper scans in millisecs.
    pub session_check_ms: u64,

    /// Upper bound of the random back-off after an aborted ballot, in
    /// microsecs.
    pub acquire_retry_max_us: u64,

    /// Interval between status checks on a resource owner of unknown
    /// liveness, in millisecs.
    pub owner_poll_ms: u64,

    /// Status checks before an acquire gives up on such an owner.
    pub max_owner_polls: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            host_name: random_host_name(),
            renewal_fraction: 0.5,
            session_timeout_ms: 10_000,
            session_check_ms: 1_000,
            acquire_retry_max_us: 1_000_000,
            owner_poll_ms: 1_000,
            max_owner_polls: 60,
        }
    }
}

fn random_host_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("host-{}", suffix.to_lowercase())
}

impl DaemonConfig {
    /// Parses the config from an optional TOML string and validates it.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, SectorlockError> {
        let config = parsed_config!(config_str => DaemonConfig;
                                    host_name, renewal_fraction,
                                    session_timeout_ms, session_check_ms,
                                    acquire_retry_max_us,
                                    owner_poll_ms, max_owner_polls)?;

        if config.host_name.is_empty() || config.host_name.len() > 48 {
            return logged_err!(
                InvalidArgument => "invalid config.host_name '{}'",
                config.host_name
            );
        }
        if !(config.renewal_fraction > 0.0 && config.renewal_fraction < 1.0) {
            return logged_err!(
                InvalidArgument => "invalid config.renewal_fraction '{}'",
                config.renewal_fraction
            );
        }
        if config.session_check_ms == 0 {
            return logged_err!(
                InvalidArgument => "invalid config.session_check_ms '{}'",
                config.session_check_ms
            );
        }
        if config.session_timeout_ms < config.session_check_ms {
            return logged_err!(
                InvalidArgument => "invalid config.session_timeout_ms '{}'",
                config.session_timeout_ms
            );
        }
        if config.owner_poll_ms == 0 {
            return logged_err!(
                InvalidArgument => "invalid config.owner_poll_ms '{}'",
                config.owner_poll_ms
            );
        }

        Ok(config)
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use crate::utils::ErrorKind;

    #[test]
    fn defaults_valid() -> Result<(), SectorlockError> {
        let config = DaemonConfig::from_toml(None)?;
        assert!(config.host_name.starts_with("host-"));
        assert_eq!(config.renewal_fraction, 0.5);
        assert_ne!(random_host_name(), random_host_name());
        Ok(())
    }

    #[test]
    fn overrides() -> Result<(), SectorlockError> {
        let config = DaemonConfig::from_toml(Some(
            "host_name = 'node-a'\nsession_timeout_ms = 500\nsession_check_ms = 100",
        ))?;
        assert_eq!(config.host_name, "node-a");
        assert_eq!(config.session_timeout_ms, 500);
        assert_eq!(config.session_check_ms, 100);
        assert_eq!(config.max_owner_polls, 60);
        Ok(())
    }

    #[test]
    fn rejects_bad_values() {
        for bad in [
            "renewal_fraction = 1.0",
            "renewal_fraction = 0.0",
            "session_check_ms = 0",
            "session_timeout_ms = 10",
            "owner_poll_ms = 0",
            "host_name = ''",
            "no_such_field = 3",
        ] {
            let e = DaemonConfig::from_toml(Some(bad)).unwrap_err();
            assert_eq!(e.kind(), ErrorKind::InvalidArgument, "{}", bad);
        }
    }
}
