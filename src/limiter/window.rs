//! Fixed-window arithmetic for the rate limiter.
//!
//! Windows are discrete, non-overlapping intervals of `window_ms` aligned to
//! the epoch. Keeping this math pure keeps it testable without a clock.

/// Returns the start of the window containing `now_ms`.
pub fn window_start(now_ms: u64, window_ms: u64) -> u64 {
    now_ms - (now_ms % window_ms)
}

/// Milliseconds until the window containing `now_ms` resets.
///
/// Always in `1..=window_ms`: a caller rejected at the last instant of a
/// window still waits at least 1ms.
pub fn retry_after_ms(now_ms: u64, window_ms: u64) -> u64 {
    window_start(now_ms, window_ms) + window_ms - now_ms
}

/// Builds the store key for one (scope, identity, window) counter.
pub fn window_key(scope: &str, identity: &str, window_start_ms: u64) -> String {
    format!("rl:{scope}:{identity}:{window_start_ms}")
}
