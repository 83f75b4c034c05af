//! TigerStyle constants for Nixie.
//!
//! All limits are explicit, named most-significant-first, and carry their
//! unit in the name. Defaults here are the single source of truth;
//! configuration may tighten them but never exceed them.

// =============================================================================
// Identifier and value limits
// =============================================================================

/// Maximum length of an actor ID in bytes
pub const ACTOR_ID_LENGTH_BYTES_MAX: usize = 64;

/// Maximum length of a store key in bytes
pub const KEY_LENGTH_BYTES_MAX: usize = 256;

/// Maximum size of a stored value in bytes (1 MiB)
pub const VALUE_SIZE_BYTES_MAX: usize = 1024 * 1024;

// =============================================================================
// Mailbox and pool limits
// =============================================================================

/// Default mailbox capacity (work items)
pub const MAILBOX_CAPACITY_DEFAULT: usize = 1000;

/// Hard ceiling on any mailbox capacity
pub const MAILBOX_CAPACITY_MAX: usize = 1_000_000;

/// Timeout a pool worker waits on the job queue before re-checking shutdown
pub const POOL_IDLE_POP_TIMEOUT_MS: u64 = 100;

// =============================================================================
// WAL limits
// =============================================================================

/// WAL file size that triggers rotation (10 MiB)
pub const WAL_FILE_SIZE_BYTES_MAX: u64 = 10 * 1024 * 1024;

// =============================================================================
// Write-behind limits
// =============================================================================

/// Default flush batch size (records)
pub const WRITE_BEHIND_BATCH_COUNT_DEFAULT: usize = 100;

/// Dirty-queue capacity (records); overflow evicts the oldest
pub const WRITE_BEHIND_QUEUE_CAPACITY: usize = 1000;

/// Flusher pop timeout; a timeout with a non-empty batch forces a flush
pub const WRITE_BEHIND_POP_TIMEOUT_MS: u64 = 100;

// =============================================================================
// Scheduler limits
// =============================================================================

/// Per-mailbox pop timeout inside one dispatch pass
pub const DISPATCH_POP_TIMEOUT_MS: u64 = 50;

/// Sleep between dispatch passes when mailboxes are quiet
pub const DISPATCH_IDLE_SLEEP_MS: u64 = 10;

/// Actor consumer-thread pop timeout
pub const CONSUMER_POP_TIMEOUT_MS: u64 = 100;

// =============================================================================
// Service limits
// =============================================================================

/// Subscribe stream drain timeout, bounds how long cancellation goes unseen
pub const SUBSCRIBE_POLL_TIMEOUT_MS: u64 = 500;

/// Per-stream inbound event queue capacity
pub const SUBSCRIBE_QUEUE_CAPACITY: usize = 1024;

/// Default TTL sweep interval for the repeating cleanup task (1 s)
pub const TTL_SWEEP_INTERVAL_MS_DEFAULT: u64 = 1000;

// Compile-time assertions on limit relationships
const _: () = {
    assert!(ACTOR_ID_LENGTH_BYTES_MAX <= KEY_LENGTH_BYTES_MAX);
    assert!(MAILBOX_CAPACITY_DEFAULT <= MAILBOX_CAPACITY_MAX);
    assert!(WRITE_BEHIND_QUEUE_CAPACITY >= WRITE_BEHIND_BATCH_COUNT_DEFAULT);
    assert!(WAL_FILE_SIZE_BYTES_MAX >= 1024 * 1024);
    assert!(SUBSCRIBE_POLL_TIMEOUT_MS >= CONSUMER_POP_TIMEOUT_MS);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_reasonable() {
        assert_eq!(WAL_FILE_SIZE_BYTES_MAX, 10 * 1024 * 1024);
        assert_eq!(MAILBOX_CAPACITY_DEFAULT, 1000);
        assert_eq!(WRITE_BEHIND_BATCH_COUNT_DEFAULT, 100);
    }
}
