use super::SqliteStore;
use rusqlite::{Connection, ErrorCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Backoff ladder for writes that hit WAL lock contention. The ladder
/// length is the retry budget; after it is spent the error surfaces.
const WRITE_BACKOFF_MS: [u64; 3] = [100, 300, 700];

static CONTENTION_HITS: AtomicU64 = AtomicU64::new(0);
static CONTENTION_RETRIES: AtomicU64 = AtomicU64::new(0);

const LOCK_MESSAGE_NEEDLES: [&str; 3] = [
    "database is locked",
    "database is busy",
    "database table is locked",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreContentionStats {
    pub busy_hits: u64,
    pub retries: u64,
}

/// Process-wide counters surfaced on the status endpoint.
pub fn contention_stats() -> StoreContentionStats {
    StoreContentionStats {
        busy_hits: CONTENTION_HITS.load(Ordering::Relaxed),
        retries: CONTENTION_RETRIES.load(Ordering::Relaxed),
    }
}

impl SqliteStore {
    /// Write with the contention ladder: every busy/locked failure burns
    /// one rung and sleeps, and the ladder running dry returns the final
    /// error. Non-contention errors return on the spot.
    pub(crate) fn retrying_execute<F>(&self, mut operation: F) -> rusqlite::Result<usize>
    where
        F: FnMut(&Connection) -> rusqlite::Result<usize>,
    {
        let mut ladder = WRITE_BACKOFF_MS.iter();
        loop {
            let error = match operation(&self.conn) {
                Ok(changed) => return Ok(changed),
                Err(error) => error,
            };
            if !lock_contention(&error) {
                return Err(error);
            }
            CONTENTION_HITS.fetch_add(1, Ordering::Relaxed);
            let Some(backoff_ms) = ladder.next() else {
                return Err(error);
            };
            CONTENTION_RETRIES.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(*backoff_ms));
        }
    }
}

fn message_signals_lock(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    LOCK_MESSAGE_NEEDLES
        .iter()
        .any(|needle| lowered.contains(needle))
}

fn lock_contention(error: &rusqlite::Error) -> bool {
    let rusqlite::Error::SqliteFailure(code, message) = error else {
        return message_signals_lock(&error.to_string());
    };
    match code.code {
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => true,
        _ => message.as_deref().map(message_signals_lock).unwrap_or(false),
    }
}

/// Same classification over an anyhow chain, for callers that own their
/// retry loop above the store (the ingest apply path).
pub fn retryable_contention(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause
            .downcast_ref::<rusqlite::Error>()
            .map(lock_contention)
            .unwrap_or_else(|| message_signals_lock(&cause.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn lock_messages_classify_as_contention() {
        assert!(retryable_contention(&anyhow!("database is locked")));
        assert!(retryable_contention(
            &anyhow!("outer context").context("Database Is Busy")
        ));
        assert!(!retryable_contention(&anyhow!("UNIQUE constraint failed")));
    }

    #[test]
    fn needle_scan_is_case_insensitive() {
        assert!(message_signals_lock("DATABASE TABLE IS LOCKED"));
        assert!(!message_signals_lock("disk I/O error"));
    }
}
