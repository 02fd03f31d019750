//! Pool of ingestion clients shared by the sink tasks of a connector.
//!
//! The pool is created once at startup with a fixed number of clients and handed to every task as
//! an `Arc<ClientManager<_>>`. Each task is pinned to one client for the lifetime of the pool; a
//! client found closed on lookup is replaced transparently.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::SinkConfig;
use crate::error::{Error, Result};
use crate::ingest::{IngestClient, IngestClientFactory};

pub struct ClientManager<F: IngestClientFactory> {
    factory: F,
    task_count: usize,
    pool_size: usize,
    /// `None` once the pool has been closed.
    clients: RwLock<Option<Vec<Arc<F::Client>>>>,
}

impl<F> ClientManager<F>
where
    F: IngestClientFactory + Sync,
{
    /// Creates the configured number of clients eagerly, for the configured number of tasks. Fails
    /// if any of them cannot be created, closing the ones already created.
    pub async fn create_all(factory: F, config: &SinkConfig) -> Result<Self> {
        let pool_size = config.client_pool.size;
        let task_count = config.client_pool.task_count;
        if pool_size == 0 || pool_size > task_count {
            return Err(Error::ClientPool(format!(
                "pool size must be between 1 and the task count ({task_count}), got {pool_size}"
            )));
        }

        let client_names: Vec<String> = (0..pool_size)
            .map(|index| {
                format!(
                    "{}_{}_{}",
                    config.client_pool.name_prefix, config.connector_name, index
                )
            })
            .collect();

        let mut clients = Vec::with_capacity(pool_size);
        for name in &client_names {
            match factory.create_client(name).await {
                Ok(client) => clients.push(Arc::new(client)),
                Err(e) => {
                    error!(client = name, ?e, "Failed to create ingestion client");
                    for client in &clients {
                        close_client(client.as_ref()).await;
                    }
                    return Err(Error::ClientPool(format!(
                        "failed to create client {name}: {e}"
                    )));
                }
            }
        }
        info!(pool_size, task_count, "Created ingestion client pool");

        Ok(Self {
            factory,
            task_count,
            pool_size,
            clients: RwLock::new(Some(clients)),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// Index of the pooled client serving the task. Tasks are grouped contiguously, every client
    /// serves at most `ceil(task_count / pool_size)` tasks.
    pub fn client_index(&self, task_id: usize) -> Result<usize> {
        if task_id >= self.task_count {
            return Err(Error::ClientPool(format!(
                "task id {task_id} is out of range, task count is {}",
                self.task_count
            )));
        }
        let tasks_per_client = self.task_count.div_ceil(self.pool_size());
        Ok(task_id / tasks_per_client)
    }

    /// The client the task must use. The same task always gets the same pooled client, unless
    /// that client was closed in which case it is replaced by a new one under the same name.
    pub async fn client_for(&self, task_id: usize) -> Result<Arc<F::Client>> {
        let index = self.client_index(task_id)?;

        {
            let clients = self.clients.read().await;
            let client = clients
                .as_ref()
                .ok_or_else(pool_closed)?
                .get(index)
                .ok_or_else(|| missing_client(index))?;
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
        }

        // the lookup found a closed client, replace it exclusively
        let mut clients = self.clients.write().await;
        let slot = clients
            .as_mut()
            .ok_or_else(pool_closed)?
            .get_mut(index)
            .ok_or_else(|| missing_client(index))?;
        // another lookup may have replaced it while we waited for the lock
        if !slot.is_closed() {
            return Ok(Arc::clone(slot));
        }

        let name = slot.name().to_string();
        warn!(client = name, "Ingestion client is closed, creating a new one");
        let client = self
            .factory
            .create_client(&name)
            .await
            .map_err(|e| Error::ClientPool(format!("failed to recreate client {name}: {e}")))?;
        *slot = Arc::new(client);
        Ok(Arc::clone(slot))
    }

    /// Closes and releases every client. Lookups fail afterwards.
    pub async fn close_all(&self) -> Result<()> {
        let Some(clients) = self.clients.write().await.take() else {
            return Ok(());
        };
        for client in &clients {
            close_client(client.as_ref()).await;
        }
        info!(pool_size = clients.len(), "Closed ingestion client pool");
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.clients.read().await.is_none()
    }
}

fn pool_closed() -> Error {
    Error::ClientPool("client pool is closed".to_string())
}

fn missing_client(index: usize) -> Error {
    Error::ClientPool(format!("no pooled client at index {index}"))
}

async fn close_client<C: IngestClient>(client: &C) {
    if client.is_closed() {
        return;
    }
    if let Err(e) = client.close().await {
        warn!(client = client.name(), ?e, "Failed to close ingestion client");
    }
}
