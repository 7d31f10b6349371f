// outpost-core/src/core/time.rs
// ============================================================================
// Module: Outpost Time Model
// Description: Canonical timestamp representation for records and leases.
// Purpose: Provide deterministic, replayable time values across Outpost records.
// ============================================================================

//! ## Overview
//! Outpost uses explicit time values embedded in records and lease fields to
//! keep processing deterministic. The core engine never reads wall-clock time
//! directly; hosts supply timestamps through the [`crate::interfaces::Clock`]
//! interface or pass them into operations explicitly.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Time Values
// ============================================================================

/// Microseconds per second.
pub const MICROS_PER_SECOND: i64 = 1_000_000;
/// Microseconds per minute.
pub const MICROS_PER_MINUTE: i64 = 60 * MICROS_PER_SECOND;

/// Canonical timestamp used in Outpost records and wire nonces.
///
/// # Invariants
/// - Values are microseconds since the Unix epoch.
/// - Values are explicitly provided by callers; the core never reads
///   wall-clock time. Monotonicity is a caller responsibility.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Self = Self(0);

    /// Creates a timestamp from microseconds since the Unix epoch.
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Creates a timestamp from whole seconds since the Unix epoch.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(MICROS_PER_SECOND))
    }

    /// Returns the timestamp as microseconds since the Unix epoch.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Returns the timestamp advanced by the given duration.
    #[must_use]
    pub const fn saturating_add(self, duration: DurationMicros) -> Self {
        Self(self.0.saturating_add(duration.as_micros()))
    }

    /// Returns the timestamp moved back by the given duration.
    #[must_use]
    pub const fn saturating_sub(self, duration: DurationMicros) -> Self {
        Self(self.0.saturating_sub(duration.as_micros()))
    }

    /// Returns the elapsed duration since an earlier timestamp.
    ///
    /// Saturates at zero when `earlier` is in the future.
    #[must_use]
    pub const fn since(self, earlier: Self) -> DurationMicros {
        let delta = self.0.saturating_sub(earlier.0);
        if delta < 0 { DurationMicros::ZERO } else { DurationMicros::from_micros(delta) }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

// ============================================================================
// SECTION: Durations
// ============================================================================

/// Duration value used for leases, cache TTLs, and throttle windows.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DurationMicros(i64);

impl DurationMicros {
    /// The zero duration.
    pub const ZERO: Self = Self(0);

    /// Creates a duration from microseconds.
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Creates a duration from whole seconds.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(MICROS_PER_SECOND))
    }

    /// Creates a duration from whole minutes.
    #[must_use]
    pub const fn from_minutes(minutes: i64) -> Self {
        Self(minutes.saturating_mul(MICROS_PER_MINUTE))
    }

    /// Returns the duration in microseconds.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Returns the duration in whole seconds, truncating.
    #[must_use]
    pub const fn as_secs(self) -> i64 {
        self.0 / MICROS_PER_SECOND
    }
}

impl fmt::Display for DurationMicros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}
