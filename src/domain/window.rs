//! Window resolution.
//!
//! A window is either a duration string (`15m`, `1h`, `7d`) or a block-count
//! lookback. The two never combine: when a lookback is configured the query
//! is bounded by block number only.

use chrono::{DateTime, Duration, Utc};

use crate::error::EngineError;

const MINUTES_PER_HOUR: u64 = 60;
const MINUTES_PER_DAY: u64 = 1_440;

/// Lower bound applied to an event query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowBound {
    /// Events with `timestamp >= since`.
    Since(DateTime<Utc>),
    /// Events with `block_number >= from_block`.
    FromBlock(u64),
}

impl WindowBound {
    /// Builds a time bound ending at `now` and spanning `minutes`.
    #[must_use]
    pub fn trailing_minutes(now: DateTime<Utc>, minutes: u64) -> Self {
        let span = i64::try_from(minutes)
            .ok()
            .and_then(Duration::try_minutes)
            .unwrap_or(Duration::MAX);
        let since = now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self::Since(since)
    }

    /// Builds a block bound reaching `lookback_blocks` below `max_block`,
    /// saturating at block 0.
    #[must_use]
    pub const fn trailing_blocks(max_block: u64, lookback_blocks: u64) -> Self {
        Self::FromBlock(max_block.saturating_sub(lookback_blocks))
    }
}

/// Parses a window string into a number of minutes.
///
/// Accepts `^\d+(m|h|d)$`: `m` is minutes, `h` is ×60, `d` is ×1440.
///
/// # Errors
///
/// Returns [`EngineError::InvalidWindowFormat`] for any other string,
/// including values whose minute count overflows `u64`.
pub fn parse_window(raw: &str) -> Result<u64, EngineError> {
    let invalid = || EngineError::InvalidWindowFormat(raw.to_string());

    let (digits, multiplier) = if let Some(d) = raw.strip_suffix('m') {
        (d, 1)
    } else if let Some(d) = raw.strip_suffix('h') {
        (d, MINUTES_PER_HOUR)
    } else if let Some(d) = raw.strip_suffix('d') {
        (d, MINUTES_PER_DAY)
    } else {
        return Err(invalid());
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    digits
        .parse::<u64>()
        .ok()
        .and_then(|value| value.checked_mul(multiplier))
        .ok_or_else(invalid)
}
