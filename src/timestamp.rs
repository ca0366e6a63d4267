//! Millisecond-precision Unix timestamps used for intent freshness checks.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::Sub;
use std::time::{SystemTime, SystemTimeError, UNIX_EPOCH};

/// A Unix timestamp in milliseconds since the epoch.
///
/// Serialized as a JSON number. Used for `PaymentIntent.timestamp` and for
/// comparisons against the configured `signature_window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixMillis(pub u64);

impl UnixMillis {
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64;
        Ok(Self(now))
    }

    /// Absolute difference between two timestamps, in milliseconds.
    pub fn abs_diff(&self, other: &Self) -> u64 {
        self.0.abs_diff(other.0)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl Sub<u64> for UnixMillis {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        UnixMillis(self.0.saturating_sub(rhs))
    }
}

impl Display for UnixMillis {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for UnixMillis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for UnixMillis {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(UnixMillis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs_diff_is_symmetric() {
        let a = UnixMillis(1_000);
        let b = UnixMillis(1_500);
        assert_eq!(a.abs_diff(&b), 500);
        assert_eq!(b.abs_diff(&a), 500);
    }

    #[test]
    fn sub_saturates_at_zero() {
        let a = UnixMillis(10);
        assert_eq!((a - 100).0, 0);
    }
}
