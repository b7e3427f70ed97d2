//! Bounded lock acquisition
//!
//! Locks guarding the shard map are taken with a try-then-timed-wait pattern:
//! attempt immediately, then wait up to a fixed ceiling and fail with
//! [`GatewayError::LockTimeout`] instead of blocking forever.

use crate::error::GatewayError;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Ceiling for timed lock waits
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Acquire a read guard, giving up after `limit`.
pub async fn read_within<'a, T>(
    lock: &'a RwLock<T>,
    name: &'static str,
    limit: Duration,
) -> Result<RwLockReadGuard<'a, T>, GatewayError> {
    if let Ok(guard) = lock.try_read() {
        return Ok(guard);
    }
    tokio::time::timeout(limit, lock.read())
        .await
        .map_err(|_| GatewayError::LockTimeout { lock: name, waited: limit })
}

/// Acquire a write guard, giving up after `limit`.
pub async fn write_within<'a, T>(
    lock: &'a RwLock<T>,
    name: &'static str,
    limit: Duration,
) -> Result<RwLockWriteGuard<'a, T>, GatewayError> {
    if let Ok(guard) = lock.try_write() {
        return Ok(guard);
    }
    tokio::time::timeout(limit, lock.write())
        .await
        .map_err(|_| GatewayError::LockTimeout { lock: name, waited: limit })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn write_times_out_while_reader_holds_lock() {
        let lock = RwLock::new(0u32);
        let _reader = lock.read().await;

        let err = write_within(&lock, "shards", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::LockTimeout { lock: "shards", .. }));
    }

    #[tokio::test]
    async fn uncontended_lock_is_acquired_immediately() {
        let lock = RwLock::new(1u32);
        {
            let mut guard = write_within(&lock, "shards", LOCK_TIMEOUT).await.unwrap();
            *guard += 1;
        }
        let guard = read_within(&lock, "shards", LOCK_TIMEOUT).await.unwrap();
        assert_eq!(*guard, 2);
    }
}
