use std::time::Duration;

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;

/// Credit granted to accounts opened without an explicit balance.
pub const DEFAULT_INITIAL_CREDIT: Decimal = dec!(1000);

/// Bounds on how long a transfer may wait on locks and on the store.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Longest wait for all per-account locks of one transfer attempt, taken together
    pub lock_timeout: Duration,

    /// No new store attempt starts once this much time has passed since the first one.
    /// A single call is not interrupted: a store that hangs inside a call blocks the
    /// transfer until the call returns.
    pub persist_timeout: Duration,

    /// Attempts per store call, the first included
    pub persist_retries: u32,

    /// Multiplied by the attempt number between store retries
    pub retry_backoff: Duration,

    /// Whole-transfer restarts after losing a version race
    pub conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            persist_timeout: Duration::from_secs(5),
            persist_retries: 3,
            retry_backoff: Duration::from_millis(50),
            conflict_retries: 3,
        }
    }
}
