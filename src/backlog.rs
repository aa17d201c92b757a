use crate::error::{Result, YamuxError};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded-permit async gate for the accept backlog.
///
/// Admitting a remotely-opened stream takes one permit; the permit travels
/// with the stream until the application accepts it (or the entry is
/// discarded), at which point dropping it releases the slot. A release
/// with waiters wakes exactly one, in FIFO order, without incrementing the
/// count; a release with no waiters returns the permit to the pool.
#[derive(Debug, Clone)]
pub(crate) struct Backlog {
    sem: Arc<Semaphore>,
}

impl Backlog {
    pub fn new(permits: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Non-suspending probe used on the SYN fast path.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.sem).try_acquire_owned().ok()
    }

    /// Suspends until a permit frees up. Fails only once the gate has been
    /// closed by session shutdown.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.sem)
            .acquire_owned()
            .await
            .map_err(|_| YamuxError::SessionShutdown)
    }

    /// Wakes every pending acquirer with an error; used at shutdown.
    pub fn close(&self) {
        self.sem.close();
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_permits_are_bounded() {
        let gate = Backlog::new(2);

        let p1 = gate.try_acquire().unwrap();
        let _p2 = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());

        drop(p1);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let gate = Backlog::new(1);
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };

        // The waiter must still be parked while the permit is held.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_release_with_waiter_does_not_increment() {
        let gate = Backlog::new(1);
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The released permit goes straight to the waiter.
        drop(held);
        let _handed_over = waiter.await.unwrap();
        assert_eq!(gate.available(), 0);
        assert!(gate.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let gate = Backlog::new(1);
        let _held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        gate.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(YamuxError::SessionShutdown)
        ));
    }
}
