//! Bounded offloading of CPU-heavy work.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::errors::InvocationError;

/// Runs key derivation, bulk decryption and hashing on tokio's blocking
/// threads, with at most `permits` jobs in flight so a burst of transfers
/// cannot occupy the whole blocking pool.
#[derive(Clone, Debug)]
pub struct CryptoPool {
    permits: Arc<Semaphore>,
}

impl CryptoPool {
    pub fn new(permits: usize) -> Self {
        Self { permits: Arc::new(Semaphore::new(permits.max(1))) }
    }

    pub async fn run<F, T>(&self, job: F) -> Result<T, InvocationError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self.permits.acquire().await.map_err(|_| InvocationError::SessionClosed)?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| InvocationError::Io(std::io::Error::other(e)))
    }
}

impl Default for CryptoPool {
    fn default() -> Self {
        Self::new(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4))
    }
}
