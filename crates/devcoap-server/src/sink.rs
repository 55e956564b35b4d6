//! Delivery sinks for ingested readings

use devcoap_core::CommandResult;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A decoded reading tagged with its origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device: String,
    pub resource: String,
    #[serde(flatten)]
    pub result: CommandResult,
}

/// Receives readings posted by the ingestion handler.
///
/// The sink takes ownership of the result.
pub trait DeliverySink: Send + Sync {
    fn post_reading(&self, device: &str, resource: &str, result: CommandResult);
}

/// Forwards readings into a bounded channel
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Reading>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Reading>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl DeliverySink for ChannelSink {
    fn post_reading(&self, device: &str, resource: &str, result: CommandResult) {
        let reading = Reading {
            device: device.to_string(),
            resource: resource.to_string(),
            result,
        };
        if let Err(e) = self.tx.try_send(reading) {
            warn!("dropping reading for {}/{}: {}", device, resource, e);
        }
    }
}

/// Writes one JSON object per reading to a writer, stdout by default
#[derive(Clone)]
pub struct JsonLinesSink {
    inner: ChannelSink,
}

impl JsonLinesSink {
    /// Spawn a writer task on stdout
    pub fn stdout() -> (Self, JoinHandle<()>) {
        Self::spawn(tokio::io::stdout())
    }

    /// Spawn a writer task on `writer`. The task ends once every sink clone
    /// is dropped, or at the first failed write; readings posted after that
    /// are dropped with a warning.
    pub fn spawn<W>(mut writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (inner, mut rx) = ChannelSink::new(256);
        let handle = tokio::spawn(async move {
            while let Some(reading) = rx.recv().await {
                let mut line = match serde_json::to_string(&reading) {
                    Ok(json) => json,
                    Err(e) => {
                        debug!("cannot serialize reading: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                let written = match writer.write_all(line.as_bytes()).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    warn!(
                        "reading writer failed, stopping delivery at {}/{}: {}",
                        reading.device, reading.resource, e
                    );
                    break;
                }
            }
        });
        (Self { inner }, handle)
    }
}

impl DeliverySink for JsonLinesSink {
    fn post_reading(&self, device: &str, resource: &str, result: CommandResult) {
        self.inner.post_reading(device, resource, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcoap_core::Value;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.post_reading("dev1", "count", CommandResult::new(Value::Int32(5)));
        let reading = rx.recv().await.unwrap();
        assert_eq!(reading.device, "dev1");
        assert_eq!(reading.resource, "count");
        assert_eq!(reading.result.value, Value::Int32(5));
    }

    #[tokio::test]
    async fn test_channel_sink_full_drops() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.post_reading("d", "r", CommandResult::new(Value::Int32(1)));
        sink.post_reading("d", "r", CommandResult::new(Value::Int32(2)));
        assert_eq!(rx.recv().await.unwrap().result.value, Value::Int32(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_json_lines() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let (sink, handle) = JsonLinesSink::spawn(writer);
        sink.post_reading("dev1", "temperature", CommandResult::new(Value::Float64(3.14)));
        drop(sink);
        handle.await.unwrap();

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        let line: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(line["device"], "dev1");
        assert_eq!(line["resource"], "temperature");
        assert_eq!(line["origin"], 0);
        assert_eq!(line["value"], 3.14);
        assert!(out.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_json_lines_stops_on_write_error() {
        let (writer, reader) = tokio::io::duplex(64);
        drop(reader);
        let (sink, handle) = JsonLinesSink::spawn(writer);
        sink.post_reading("dev1", "count", CommandResult::new(Value::Int32(1)));

        // the task ends on the broken pipe even though the sink is still alive
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("writer task should stop")
            .unwrap();
        sink.post_reading("dev1", "count", CommandResult::new(Value::Int32(2)));
    }
}
