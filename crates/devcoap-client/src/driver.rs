//! GET/PUT command facade
//!
//! Each requested resource gets its own session and exchange. Exchanges are
//! serialized by an async mutex held across open, send and wait, so at most
//! one is in flight per driver.

use devcoap_core::{codec, CommandResult, DeviceRecord, Directory, EndDeviceAddress, UriPath, Value};
use devcoap_transport::{SessionConfig, SessionManager};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ClientError, Result};
use crate::exchange::{Exchange, ExchangeOutcome};

/// Outbound command driver
pub struct CoapDriver {
    directory: Arc<dyn Directory>,
    sessions: SessionManager,
    exchange_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl CoapDriver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self::with_config(directory, SessionConfig::default(), CancellationToken::new())
    }

    pub fn with_config(
        directory: Arc<dyn Directory>,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            directory,
            sessions: SessionManager::new(config),
            exchange_lock: Mutex::new(()),
            shutdown,
        }
    }

    /// Token whose cancellation aborts in-flight exchanges
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Abort any exchange in flight and refuse new ones
    pub fn shutdown(&self) {
        info!("COAP driver stopping");
        self.shutdown.cancel();
    }

    fn device(&self, name: &str) -> Result<Arc<DeviceRecord>> {
        self.directory.device(name).ok_or_else(|| {
            error!("Device {} not found", name);
            ClientError::DeviceNotFound(name.to_string())
        })
    }

    /// Read each resource of `device`.
    ///
    /// Every resource is attempted. Values come back in request order; if any
    /// read fails the call fails with the names of the failed resources.
    pub async fn get(&self, device: &str, resources: &[&str]) -> Result<Vec<CommandResult>> {
        let record = self.device(device)?;
        let address = record.address()?;
        debug!("Triggering Get events nreadings={}", resources.len());

        let mut readings = Vec::with_capacity(resources.len());
        let mut failed = Vec::new();

        for name in resources {
            if self.shutdown.is_cancelled() {
                return Err(ClientError::Aborted);
            }
            let Some(resource) = record.resource(name) else {
                error!("Resource {} not found on device {}", name, device);
                failed.push(name.to_string());
                continue;
            };
            debug!("Triggering Get events resource name={}", name);

            let outcome = match UriPath::new(device, name) {
                Ok(path) => {
                    self.exchange(address, path, |session, path| {
                        Exchange::read(session, path, resource.value_type.clone())
                    })
                    .await
                }
                Err(e) => ExchangeOutcome::ApplicationFailure(e.to_string()),
            };

            match outcome {
                ExchangeOutcome::Value(value) => {
                    debug!("Triggering Get events success for {}", name);
                    readings.push(CommandResult::new(value));
                }
                ExchangeOutcome::Aborted => return Err(ClientError::Aborted),
                other => {
                    error!("Triggering Get events failed for {}: {}", name, other);
                    failed.push(name.to_string());
                }
            }
        }

        if failed.is_empty() {
            Ok(readings)
        } else {
            Err(ClientError::ReadFailed { failed })
        }
    }

    /// Write each `(resource, value)` pair to `device`.
    ///
    /// A value that cannot be encoded for its resource stops the whole call
    /// before that value is sent. A failed exchange is recorded and the
    /// remaining values are still written.
    pub async fn put(&self, device: &str, values: &[(&str, Value)]) -> Result<()> {
        let record = self.device(device)?;
        let address = record.address()?;
        debug!("PUT on device: {} nvalues = {}", device, values.len());

        let mut failed = Vec::new();
        for (name, value) in values {
            if self.shutdown.is_cancelled() {
                return Err(ClientError::Aborted);
            }
            let resource = record
                .resource(name)
                .ok_or_else(|| ClientError::ResourceNotFound {
                    device: device.to_string(),
                    resource: name.to_string(),
                })?;
            debug!("  Value: {}", value);

            let payload = codec::encode_for(value, &resource.value_type).map_err(|e| {
                error!("Value for {} has unexpected type: {}", name, e);
                ClientError::Codec(e)
            })?;
            let path = UriPath::new(device, name)
                .map_err(|e| ClientError::Configuration(e.into()))?;

            let outcome = self
                .exchange(address, path, |session, path| {
                    Exchange::write(session, path, payload)
                })
                .await;
            match outcome {
                ExchangeOutcome::Written(_) => {}
                ExchangeOutcome::Aborted => return Err(ClientError::Aborted),
                other => {
                    error!("Sending data to End Device fails: {}", other);
                    failed.push(name.to_string());
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ClientError::WriteFailed { failed })
        }
    }

    /// Run one exchange under the driver lock
    async fn exchange<F>(&self, address: &EndDeviceAddress, path: UriPath, build: F) -> ExchangeOutcome
    where
        F: FnOnce(devcoap_transport::Session, UriPath) -> Exchange,
    {
        let _guard = self.exchange_lock.lock().await;
        debug!("End dev addr = {}", address.host());

        // a PSK open may sit in the handshake; shutdown must not wait for it
        let opened = tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("session open for {} aborted by shutdown", path);
                return ExchangeOutcome::Aborted;
            }
            opened = self.sessions.open(address) => opened,
        };
        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                error!("cannot open session for {}: {}", path, e);
                return ExchangeOutcome::TransportFailure(e.to_string());
            }
        };
        build(session, path).run(&self.shutdown).await
    }
}
