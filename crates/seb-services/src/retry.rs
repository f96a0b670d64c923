//! Bounded retry around persistence calls.

use seb_protocol::{SessionError, StoreError};
use tracing::warn;

/// Run `op` up to `attempts` times (at least once). The last failure is
/// surfaced as [`SessionError::TransientStore`].
pub fn with_retry<T>(
    attempts: u32,
    what: &str,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, SessionError> {
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{what} failed (attempt {attempt}/{attempts}): {e}");
                last = Some(e);
            }
        }
    }
    let reason = last.map(|e| e.to_string()).unwrap_or_default();
    Err(SessionError::TransientStore(format!("{what}: {reason}")))
}
