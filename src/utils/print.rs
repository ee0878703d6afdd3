//! Logging macros prefixed with this host's identity.

use std::sync::OnceLock;

use env_logger::Env;

/// Host identity printed in front of every log line; set once to the
/// daemon's `host_name`. Lines logged before that show `-`.
pub static ME: OnceLock<String> = OnceLock::new();

/// Logs at the given `log` level with the `(ME)` prefix. Use the `pf_*`
/// shorthands instead.
#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($level:ident, $($fmt_args:tt)*) => {
        log::$level!(
            "({}) {}",
            $crate::ME.get().map_or("-", String::as_str),
            format_args!($($fmt_args)*)
        )
    };
}

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!("read {} sectors at {}", count, disk);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => { $crate::pf_log!(trace, $($fmt_args)*) };
}

/// Log DEBUG message with parenthesized prefix.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => { $crate::pf_log!(debug, $($fmt_args)*) };
}

/// Log INFO message with parenthesized prefix.
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => { $crate::pf_log!(info, $($fmt_args)*) };
}

/// Log WARN message with parenthesized prefix.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => { $crate::pf_log!(warn, $($fmt_args)*) };
}

/// Log ERROR message with parenthesized prefix.
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => { $crate::pf_log!(error, $($fmt_args)*) };
}

/// Sets up `env_logger` once: `info` unless `RUST_LOG` says otherwise, and
/// bare lines without timestamps or module paths.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Logs the message at ERROR and evaluates to `Err(SectorlockError)` with
/// it. A leading `Kind =>` picks the `ErrorKind`; without it the kind is
/// `Other`.
///
/// Example:
/// ```no_compile
/// return logged_err!(InvalidArgument => "bad sector size {}", size);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($kind:ident => $($fmt_args:tt)*) => {{
        let msg = format!($($fmt_args)*);
        $crate::pf_error!("{}", msg);
        Err($crate::SectorlockError::with_kind($crate::ErrorKind::$kind, msg))
    }};
    ($($fmt_args:tt)*) => {{
        let msg = format!($($fmt_args)*);
        $crate::pf_error!("{}", msg);
        Err($crate::SectorlockError::msg(msg))
    }};
}
