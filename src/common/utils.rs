//! Utility functions for tablecoord

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Has the shutdown signal fired (or its sender gone away)?
pub fn is_interrupted(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Run `fut` unless `shutdown` fires first.
///
/// A dropped shutdown sender counts as an interruption, so orphaned tasks unwind.
pub async fn interruptible<F>(
    fut: F,
    shutdown: &mut watch::Receiver<bool>,
) -> crate::Result<F::Output>
where
    F: Future,
{
    if is_interrupted(shutdown) {
        return Err(crate::Error::Interrupted);
    }
    tokio::select! {
        out = fut => Ok(out),
        _ = shutdown.wait_for(|stop| *stop) => Err(crate::Error::Interrupted),
    }
}

/// Sleep for `delay` unless interrupted.
pub async fn nap(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> crate::Result<()> {
    interruptible(tokio::time::sleep(delay), shutdown).await
}

/// Wait until a boolean watch reads `true`.
pub async fn wait_until_true(
    flag: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> crate::Result<()> {
    match interruptible(flag.wait_for(|ready| *ready), shutdown).await? {
        Ok(_) => Ok(()),
        Err(_) => Err(crate::Error::Raft("readiness signal closed".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_stable() {
        assert_eq!(crc32(b"contract"), crc32(b"contract"));
        assert_ne!(crc32(b"contract"), crc32(b"contracts"));
    }

    #[tokio::test]
    async fn test_interruptible_completes() {
        let (_tx, mut rx) = watch::channel(false);
        let out = interruptible(async { 7 }, &mut rx).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn test_nap_interrupted() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move { nap(Duration::from_secs(60), &mut rx).await });
        tx.send(true).unwrap();
        let res = handle.await.unwrap();
        assert_eq!(res, Err(crate::Error::Interrupted));
    }

    #[tokio::test]
    async fn test_already_interrupted() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert_eq!(
            interruptible(async { 1 }, &mut rx).await,
            Err(crate::Error::Interrupted)
        );
    }

    #[tokio::test]
    async fn test_wait_until_true() {
        let (_stop_tx, mut stop_rx) = watch::channel(false);
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let waiter =
            tokio::spawn(async move { wait_until_true(&mut ready_rx, &mut stop_rx).await });
        ready_tx.send(true).unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }
}
