//! Several job servers behind one submission interface.

use std::collections::BTreeMap;
use std::sync::RwLock;

use bytes::Bytes;
use rand::Rng;

use super::client::{Client, ClientBuilder, ClientConfig, ErrorHandler, ResponseHandler};
use super::response::Status;
use crate::error::{GearmanError, Result};
use crate::protocol::Priority;

/// Default number of selection attempts per call.
pub const DEFAULT_POOL_RETRY: usize = 5;

/// Picks the server for the next call.
pub trait SelectionStrategy: Send + Sync {
    /// Index into `weights` of the chosen server, `None` if there is none.
    fn select(&self, weights: &[u32]) -> Option<usize>;
}

/// Chooses each server with probability proportional to its weight.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedRandom;

impl SelectionStrategy for WeightedRandom {
    fn select(&self, weights: &[u32]) -> Option<usize> {
        let total: u64 = weights.iter().map(|&w| u64::from(w)).sum();
        if total == 0 {
            return UniformRandom.select(weights);
        }
        let mut pick = rand::thread_rng().gen_range(0..total);
        for (i, &w) in weights.iter().enumerate() {
            let w = u64::from(w);
            if pick < w {
                return Some(i);
            }
            pick -= w;
        }
        None
    }
}

/// Chooses every server with equal probability.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformRandom;

impl SelectionStrategy for UniformRandom {
    fn select(&self, weights: &[u32]) -> Option<usize> {
        if weights.is_empty() {
            None
        } else {
            Some(rand::thread_rng().gen_range(0..weights.len()))
        }
    }
}

struct PoolItem {
    client: Client,
    weight: u32,
}

/// Clients for several servers, one chosen per call.
///
/// Status queries name their server explicitly: a handle is only meaningful
/// on the server that issued it.
pub struct Pool {
    items: RwLock<BTreeMap<String, PoolItem>>,
    strategy: Box<dyn SelectionStrategy>,
    retry: usize,
    config: ClientConfig,
    on_error: Option<ErrorHandler>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    /// Empty pool with weighted selection.
    pub fn new() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            strategy: Box::new(WeightedRandom),
            retry: DEFAULT_POOL_RETRY,
            config: ClientConfig::default(),
            on_error: None,
        }
    }

    pub fn with_strategy<S: SelectionStrategy + 'static>(mut self, strategy: S) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn with_retry(mut self, retry: usize) -> Self {
        self.retry = retry;
        self
    }

    /// Settings for clients added from now on.
    pub fn with_client_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Error callback for clients added from now on.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(GearmanError) + Send + Sync + 'static,
    {
        self.on_error = Some(std::sync::Arc::new(f));
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, PoolItem>> {
        self.items.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, PoolItem>> {
        self.items.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect to a server, or update its weight if already present.
    pub async fn add(&self, addr: &str, weight: u32) -> Result<()> {
        if let Some(item) = self.write().get_mut(addr) {
            item.weight = weight;
            return Ok(());
        }

        let mut builder = ClientBuilder::new().config(self.config.clone());
        if let Some(on_error) = self.on_error.clone() {
            builder = builder.on_error(move |e| on_error(e));
        }
        let client = builder.connect(addr).await?;

        let replaced = self
            .write()
            .insert(addr.to_string(), PoolItem { client, weight });
        if let Some(old) = replaced {
            old.client.close();
        }
        tracing::debug!("Added {} to pool with weight {}", addr, weight);
        Ok(())
    }

    /// Close and forget a server. Returns false if it was not in the pool.
    pub fn remove(&self, addr: &str) -> bool {
        match self.write().remove(addr) {
            Some(item) => {
                item.client.close();
                true
            }
            None => false,
        }
    }

    /// Server addresses currently in the pool.
    pub fn servers(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Client for `addr`, if present.
    pub fn client(&self, addr: &str) -> Option<Client> {
        self.read().get(addr).map(|item| item.client.clone())
    }

    fn select(&self) -> Option<(String, Client)> {
        let items = self.read();
        let weights: Vec<u32> = items.values().map(|item| item.weight).collect();
        let index = self.strategy.select(&weights)?;
        items
            .iter()
            .nth(index)
            .map(|(addr, item)| (addr.clone(), item.client.clone()))
    }

    /// Pick a connected server, trying up to `retry` times.
    fn select_connected(&self) -> Result<(String, Client)> {
        for _ in 0..self.retry.max(1) {
            match self.select() {
                Some((addr, client)) if client.is_connected() => return Ok((addr, client)),
                Some((addr, _)) => tracing::debug!("Skipping disconnected server {}", addr),
                None => break,
            }
        }
        Err(GearmanError::NoServers)
    }

    /// Submit a job on a selected server. Returns the server address and handle.
    pub async fn do_job<H>(
        &self,
        function: &str,
        data: impl Into<Bytes>,
        priority: Priority,
        handler: H,
    ) -> Result<(String, String)>
    where
        H: ResponseHandler,
    {
        let (addr, client) = self.select_connected()?;
        let handle = client.do_job(function, data, priority, handler).await?;
        Ok((addr, handle))
    }

    /// Submit a background job on a selected server.
    pub async fn do_background(
        &self,
        function: &str,
        data: impl Into<Bytes>,
        priority: Priority,
    ) -> Result<(String, String)> {
        let (addr, client) = self.select_connected()?;
        let handle = client.do_background(function, data, priority).await?;
        Ok((addr, handle))
    }

    /// Query a job on the server that created it.
    pub async fn status(&self, addr: &str, handle: &str) -> Result<Status> {
        let client = self.client(addr).ok_or(GearmanError::NoServers)?;
        client.status(handle).await
    }

    /// Echo through a selected server.
    pub async fn echo(&self, data: impl Into<Bytes>) -> Result<Bytes> {
        let (_, client) = self.select_connected()?;
        client.echo(data).await
    }

    /// Close every client and empty the pool.
    pub fn close(&self) {
        let items = std::mem::take(&mut *self.write());
        for item in items.into_values() {
            item.client.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_weighted_skips_zero_weight() {
        for _ in 0..200 {
            assert_eq!(WeightedRandom.select(&[0, 5, 0]), Some(1));
        }
    }

    #[test]
    fn test_weighted_roughly_proportional() {
        let mut hits = [0usize; 2];
        for _ in 0..4000 {
            hits[WeightedRandom.select(&[1, 3]).unwrap()] += 1;
        }
        // Expect ~1000 / ~3000
        assert!(hits[0] > 600 && hits[0] < 1400, "{hits:?}");
    }

    #[test]
    fn test_all_zero_weights_fall_back_to_uniform() {
        let picked = WeightedRandom.select(&[0, 0]).unwrap();
        assert!(picked < 2);
    }

    #[test]
    fn test_empty_selection() {
        assert_eq!(WeightedRandom.select(&[]), None);
        assert_eq!(UniformRandom.select(&[]), None);
    }

    #[test]
    fn test_uniform_covers_all() {
        let mut seen = [false; 3];
        for _ in 0..300 {
            seen[UniformRandom.select(&[1, 1, 1]).unwrap()] = true;
        }
        assert_eq!(seen, [true; 3]);
    }

    #[tokio::test]
    async fn test_empty_pool_has_no_servers() {
        let pool = Pool::new();
        let err = pool.echo("x").await.unwrap_err();
        assert!(matches!(err, GearmanError::NoServers));
        assert!(matches!(
            pool.status("nowhere:1", "H:1").await,
            Err(GearmanError::NoServers)
        ));
    }

    #[tokio::test]
    async fn test_add_update_remove() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let pool = Pool::new().with_strategy(UniformRandom).with_retry(2);

        pool.add(&addr, 1).await.unwrap();
        let _conn = listener.accept().await.unwrap();
        pool.add(&addr, 9).await.unwrap();

        assert_eq!(pool.servers(), vec![addr.clone()]);
        assert_eq!(pool.read().get(&addr).map(|i| i.weight), Some(9));

        assert!(pool.remove(&addr));
        assert!(!pool.remove(&addr));
        assert!(pool.is_empty());
    }
}
