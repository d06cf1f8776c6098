use std::{future::Future, time::Duration};

use bytes::Bytes;
use etcd_client::{Client, ConnectOptions};
use log::{info, warn};
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};

use super::{MetadataError, MetadataStore};

/// Discovery store backed by an etcd cluster.
///
/// The engine API is blocking, so the store drives its own runtime and must
/// not be called from inside another Tokio runtime; such calls fail with
/// [`MetadataError::Unavailable`]. The client connects on first use and is
/// dropped after any error so the next call reconnects.
pub struct EtcdStore {
    endpoints: Vec<String>,
    options: ConnectOptions,
    runtime: Runtime,
    client: Mutex<Option<Client>>,
}

impl EtcdStore {
    /// `endpoints` is a comma separated `host:port` list.
    pub fn new(endpoints: &str, timeout: Duration) -> Result<Self, MetadataError> {
        let endpoints: Vec<String> = endpoints
            .split(',')
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .map(str::to_string)
            .collect();
        if endpoints.is_empty() {
            return Err(MetadataError::Unavailable(
                "no etcd endpoints given".to_string(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("segflow-etcd")
            .enable_all()
            .build()
            .map_err(|error| MetadataError::Unavailable(format!("etcd runtime: {error}")))?;
        Ok(Self {
            endpoints,
            options: ConnectOptions::new()
                .with_connect_timeout(timeout)
                .with_timeout(timeout),
            runtime,
            client: Mutex::new(None),
        })
    }

    fn client(&self) -> Result<Client, MetadataError> {
        let cached = self.client.lock().clone();
        if let Some(client) = cached {
            return Ok(client);
        }
        let client = self
            .runtime
            .block_on(Client::connect(
                self.endpoints.clone(),
                Some(self.options.clone()),
            ))
            .map_err(|error| {
                MetadataError::Unavailable(format!(
                    "connect etcd at {}: {error}",
                    self.endpoints.join(",")
                ))
            })?;
        info!("connected to etcd at {}", self.endpoints.join(","));
        *self.client.lock() = Some(client.clone());
        Ok(client)
    }

    fn with_client<T, F, Fut>(&self, op: F) -> Result<T, MetadataError>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<T, etcd_client::Error>>,
    {
        if Handle::try_current().is_ok() {
            return Err(MetadataError::Unavailable(
                "etcd store called from inside an async runtime".to_string(),
            ));
        }
        let client = self.client()?;
        match self.runtime.block_on(op(client)) {
            Ok(value) => Ok(value),
            Err(error) => {
                warn!("etcd request failed, dropping client: {error}");
                *self.client.lock() = None;
                Err(MetadataError::Unavailable(error.to_string()))
            }
        }
    }
}

impl MetadataStore for EtcdStore {
    fn get(&self, key: &str) -> Result<Option<Bytes>, MetadataError> {
        let key = key.to_string();
        self.with_client(|mut client| async move {
            let response = client.get(key, None).await?;
            Ok(response
                .kvs()
                .first()
                .map(|kv| Bytes::copy_from_slice(kv.value())))
        })
    }

    fn set(&self, key: &str, value: Bytes) -> Result<(), MetadataError> {
        let key = key.to_string();
        self.with_client(|mut client| async move {
            client.put(key, value.to_vec(), None).await?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<(), MetadataError> {
        let key = key.to_string();
        self.with_client(|mut client| async move {
            client.delete(key, None).await?;
            Ok(())
        })
    }
}
