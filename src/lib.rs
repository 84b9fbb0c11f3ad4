//! Perfalert - change-point detection for push-ordered performance series
//!
//! This library classifies performance measurements into good, regressed,
//! improved or machine-specific states, orders them by the push time of the
//! revision they measured, and decides which changes still need a human's
//! attention.
//!
//! Data flows leaf-first:
//!
//! ```text
//! raw samples → RevisionIndex (push order) → ChangeDetector → AlertLedger → NotifyEvent
//! ```

pub mod analysis;
pub mod cli;
pub mod config;
pub mod datum;
pub mod detector;
pub mod ledger;
pub mod persist;
pub mod pushlog;
pub mod runner;
pub mod source;
pub mod stats;

/// Current Unix time in seconds
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
