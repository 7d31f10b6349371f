// outpost-core/src/runtime/clock.rs
// ============================================================================
// Module: Outpost Time Sources
// Description: Wall-clock and deterministic clock implementations.
// Purpose: Provide Clock implementations for hosts and tests.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! The engine only ever sees the [`Clock`] interface. Hosts install
//! [`SystemClock`]; tests install [`FixedClock`] and advance it explicitly to
//! drive lease expiry, approval TTLs, and throttle windows deterministically.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use crate::core::time::DurationMicros;
use crate::core::time::Timestamp;
use crate::interfaces::Clock;

// ============================================================================
// SECTION: System Clock
// ============================================================================

/// Wall-clock time source.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a new system clock.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Timestamp::from_micros(micros)
    }
}

// ============================================================================
// SECTION: Fixed Clock
// ============================================================================

/// Deterministic clock for tests, advanced explicitly.
#[derive(Debug, Default)]
pub struct FixedClock {
    /// Current time, guarded for cross-thread test use.
    now: Mutex<Timestamp>,
}

impl FixedClock {
    /// Creates a fixed clock starting at the given time.
    #[must_use]
    pub fn starting_at(now: Timestamp) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Sets the current time.
    pub fn set(&self, now: Timestamp) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    /// Advances the current time by the given duration.
    pub fn advance(&self, duration: DurationMicros) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = guard.saturating_add(duration);
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.now.lock().map(|guard| *guard).unwrap_or_default()
    }
}
