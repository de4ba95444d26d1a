use std::{ops::Deref, time::Duration};

use crate::RatemeshError;

/// A validated newtype for the per-window request capacity.
///
/// Must be greater than zero; a limiter that can never admit anything is a
/// configuration mistake, not a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MaxRequests(usize);

impl Deref for MaxRequests {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for MaxRequests {
    fn default() -> Self {
        Self(30)
    }
}

impl TryFrom<usize> for MaxRequests {
    type Error = RatemeshError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(RatemeshError::InvalidConfig(
                "max_requests must be greater than zero".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// A validated newtype for the sliding window duration.
///
/// Must be non-zero; no request can fall "within" a zero window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WindowDuration(Duration);

impl Deref for WindowDuration {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for WindowDuration {
    fn default() -> Self {
        Self(Duration::from_secs(10))
    }
}

impl TryFrom<Duration> for WindowDuration {
    type Error = RatemeshError;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        if value.is_zero() {
            Err(RatemeshError::InvalidConfig(
                "window must be greater than zero".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// A validated newtype for the stream name events are published to.
///
/// Must not be empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamName(String);

impl StreamName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for StreamName {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Default for StreamName {
    fn default() -> Self {
        Self("ratemesh".to_string())
    }
}

impl TryFrom<String> for StreamName {
    type Error = RatemeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(RatemeshError::InvalidConfig(
                "stream name must not be empty".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// A snapshot of a window's state, taken at decision time.
///
/// Purely informational; callers typically surface it as `RateLimit-*`
/// response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Maximum number of acceptances permitted within any window.
    pub limit: usize,
    /// Acceptances still available at the observation time.
    pub remaining: usize,
    /// Time until the oldest in-window entry expires; zero when not full.
    pub reset: Duration,
    /// The configured window duration.
    pub window: Duration,
}
