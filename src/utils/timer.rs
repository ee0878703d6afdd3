//! Lease clock helpers: wall-clock timestamps and a sliding deadline.

use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::utils::SectorlockError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Whole seconds since the Unix epoch, never zero. Lease timestamps use this
/// clock; zero is reserved to mean "free".
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .max(1)
}

/// A deadline that lies a fixed window after the last `extend()`, e.g. the
/// point by which the next lease renewal must have succeeded.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Deadline {
    /// Pinned so that `reached()` can be polled again after a `select!`
    /// branch lost.
    sleep: Pin<Box<Sleep>>,
    window: Duration,
}

impl Deadline {
    /// A deadline `window` from now. The window must be non-zero.
    pub fn start(window: Duration) -> Result<Self, SectorlockError> {
        if window.is_zero() {
            return Err(SectorlockError::invalid("zero deadline window"));
        }
        Ok(Deadline {
            sleep: Box::pin(time::sleep(window)),
            window,
        })
    }

    #[inline]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Moves the deadline to one window from now.
    pub fn extend(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.window);
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.sleep
            .deadline()
            .saturating_duration_since(Instant::now())
    }

    #[inline]
    pub fn passed(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Resolves when the deadline passes. Meant as a `tokio::select!` branch.
    pub async fn reached(&mut self) {
        self.sleep.as_mut().await
    }
}
