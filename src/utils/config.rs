//! TOML overrides on top of a configuration struct's defaults.

/// Builds `$config_type::default()` and overrides the listed fields from an
/// optional TOML string. Keys not in the list, unparsable TOML, and values of
/// the wrong type are all `InvalidArgument` errors naming the culprit.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => DaemonConfig;
///                             host_name, session_timeout_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        let compose_config = || -> Result<$config_type, $crate::SectorlockError> {
            let mut config = <$config_type>::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table =
                config_str.parse::<toml::Table>().map_err(|e| {
                    $crate::SectorlockError::invalid(format!(
                        "malformed config: {}",
                        e
                    ))
                })?;

            $(
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into().map_err(|e| {
                        $crate::SectorlockError::invalid(format!(
                            "config.{}: {}",
                            stringify!($field),
                            e
                        ))
                    })?;
                }
            )+

            // leftovers are keys the struct does not take
            let mut unknown: Vec<&String> = table.keys().collect();
            if !unknown.is_empty() {
                unknown.sort();
                return Err($crate::SectorlockError::invalid(format!(
                    "unknown config field(s) {:?}",
                    unknown
                )));
            }
            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::{ErrorKind, SectorlockError};

    #[derive(Debug, PartialEq)]
    struct SampleConfig {
        retries: u16,
        label: String,
        fraction: f64,
    }

    impl Default for SampleConfig {
        fn default() -> Self {
            SampleConfig {
                retries: 3,
                label: "sample".into(),
                fraction: 0.25,
            }
        }
    }

    #[test]
    fn defaults_without_string() -> Result<(), SectorlockError> {
        let config =
            parsed_config!(None => SampleConfig; retries, label, fraction)?;
        assert_eq!(config, SampleConfig::default());
        Ok(())
    }

    #[test]
    fn partial_override() -> Result<(), SectorlockError> {
        let config = parsed_config!(Some("label = 'disk-a'\nretries = 9")
                                    => SampleConfig; retries, label, fraction)?;
        assert_eq!(
            config,
            SampleConfig {
                retries: 9,
                label: "disk-a".into(),
                fraction: 0.25,
            }
        );
        Ok(())
    }

    #[test]
    fn rejects_unknown_and_mistyped() {
        for bad in ["zzz = 1\naaa = 2", "retries = 'many'", "retries = 70000", "= 3"] {
            let e = parsed_config!(Some(bad) => SampleConfig; retries, label)
                .unwrap_err();
            assert_eq!(e.kind(), ErrorKind::InvalidArgument, "{}", bad);
        }
        let e = parsed_config!(Some("zzz = 1\naaa = 2") => SampleConfig; retries)
            .unwrap_err();
        assert!(e.to_string().contains("[\"aaa\", \"zzz\"]"));
    }
}
