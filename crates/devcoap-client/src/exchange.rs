//! Request/response correlation
//!
//! An [`Exchange`] owns one session and one confirmable request. Its state
//! moves `Idle -> Sent -> {Completed | Failed | Aborted}` and waiting on it
//! yields exactly one [`ExchangeOutcome`]. The session is closed on every
//! terminal path.

use bytes::Bytes;
use coap_lite::{MessageClass, MessageType, Packet, RequestType};
use devcoap_core::packet::{code_text, is_success, new_packet};
use devcoap_core::{codec, PacketExt, ResourceType, UriPath, Value};
use devcoap_transport::{EngineEvent, Session, Submitted, TransportError};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Correlator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Sent,
    Completed,
    Failed,
    Aborted,
}

impl ExchangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeState::Completed | ExchangeState::Failed | ExchangeState::Aborted
        )
    }
}

/// The single result of an exchange
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOutcome {
    /// A read decoded to a value
    Value(Value),
    /// A write was answered
    Written(MessageClass),
    /// The transport could not deliver the request or its answer
    TransportFailure(String),
    /// The device answered, but not with a usable value
    ApplicationFailure(String),
    /// Shutdown was requested before the exchange finished
    Aborted,
}

impl ExchangeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExchangeOutcome::Value(_) | ExchangeOutcome::Written(_))
    }
}

impl fmt::Display for ExchangeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeOutcome::Value(v) => write!(f, "value {}", v),
            ExchangeOutcome::Written(code) => write!(f, "written ({})", code_text(*code)),
            ExchangeOutcome::TransportFailure(reason) => write!(f, "transport failure: {}", reason),
            ExchangeOutcome::ApplicationFailure(reason) => {
                write!(f, "application failure: {}", reason)
            }
            ExchangeOutcome::Aborted => f.write_str("aborted"),
        }
    }
}

/// What the request asks of the resource
#[derive(Debug, Clone)]
enum Request {
    Read { resource_type: ResourceType },
    Write { payload: Bytes },
}

/// One outbound exchange
pub struct Exchange {
    session: Session,
    path: UriPath,
    request: Request,
    state: ExchangeState,
    pending: Option<Submitted>,
    failure: Option<String>,
}

impl Exchange {
    /// A GET whose answer is decoded as `resource_type`
    pub fn read(session: Session, path: UriPath, resource_type: ResourceType) -> Self {
        Self::new(session, path, Request::Read { resource_type })
    }

    /// A PUT carrying an already encoded payload
    pub fn write(session: Session, path: UriPath, payload: Bytes) -> Self {
        Self::new(session, path, Request::Write { payload })
    }

    fn new(session: Session, path: UriPath, request: Request) -> Self {
        Self {
            session,
            path,
            request,
            state: ExchangeState::Idle,
            pending: None,
            failure: None,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn path(&self) -> &UriPath {
        &self.path
    }

    fn build_message(&self) -> Packet {
        let method = match self.request {
            Request::Read { .. } => RequestType::Get,
            Request::Write { .. } => RequestType::Put,
        };
        let mut message = new_packet(MessageType::Confirmable, MessageClass::Request(method), 0);
        for segment in self.path.segments() {
            debug!("uri.path_val = {}", segment);
        }
        message.set_uri_segments(self.path.segments());
        if let Request::Write { payload } = &self.request {
            debug!("Data len = {}", payload.len());
            message.payload = payload.to_vec();
        }
        message
    }

    /// Build and submit the request: `Idle -> Sent`, or `Idle -> Failed`
    /// when submission is refused.
    pub async fn send(&mut self) -> Result<(), TransportError> {
        if self.state != ExchangeState::Idle {
            return Err(TransportError::Protocol(format!(
                "exchange already {:?}",
                self.state
            )));
        }

        let message = self.build_message();
        match self.session.engine().submit(message).await {
            Ok(pending) => {
                debug!("request sent to {}{}", self.session.peer_addr(), self.path);
                self.pending = Some(pending);
                self.state = ExchangeState::Sent;
                Ok(())
            }
            Err(e) => {
                error!("cannot send request {}: {}", self.path, e);
                self.failure = Some(e.to_string());
                self.state = ExchangeState::Failed;
                Err(e)
            }
        }
    }

    /// Wait for the outcome, then release the session.
    ///
    /// Cancelling `cancel` ends the wait promptly with `Aborted`.
    pub async fn wait(mut self, cancel: &CancellationToken) -> ExchangeOutcome {
        let outcome = self.drive(cancel).await;
        self.session.close().await;
        debug!("exchange {} ended {:?}: {}", self.path, self.state, outcome);
        outcome
    }

    /// Send, then wait
    pub async fn run(mut self, cancel: &CancellationToken) -> ExchangeOutcome {
        if cancel.is_cancelled() {
            self.state = ExchangeState::Aborted;
        } else {
            // a refused submission leaves the exchange Failed
            let _ = self.send().await;
        }
        self.wait(cancel).await
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> ExchangeOutcome {
        let mut pending = match (self.state, self.pending.take()) {
            (ExchangeState::Sent, Some(pending)) => pending,
            (ExchangeState::Aborted, _) => return ExchangeOutcome::Aborted,
            (ExchangeState::Idle, _) => {
                self.state = ExchangeState::Failed;
                return ExchangeOutcome::TransportFailure("request was never sent".to_string());
            }
            _ => {
                self.state = ExchangeState::Failed;
                let reason = self
                    .failure
                    .take()
                    .unwrap_or_else(|| "request not submitted".to_string());
                return ExchangeOutcome::TransportFailure(reason);
            }
        };

        let engine = self.session.engine();
        let event = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("exchange {} aborted by shutdown", self.path);
                    self.state = ExchangeState::Aborted;
                    return ExchangeOutcome::Aborted;
                }
                event = engine.process_io(&mut pending) => {
                    if let Some(event) = event {
                        break event;
                    }
                }
            }
        };

        match event {
            EngineEvent::Response(response) => {
                self.state = ExchangeState::Completed;
                self.complete(response)
            }
            EngineEvent::Nack(reason) => {
                error!("NACK response from server: {}", reason);
                self.state = ExchangeState::Failed;
                ExchangeOutcome::TransportFailure(reason.to_string())
            }
        }
    }

    fn complete(&self, response: Packet) -> ExchangeOutcome {
        let code = response.header.code;
        debug!("response {} with {} bytes", code_text(code), response.payload.len());
        match &self.request {
            Request::Write { .. } => {
                if !is_success(code) {
                    warn!("write to {} answered with {}", self.path, code_text(code));
                }
                ExchangeOutcome::Written(code)
            }
            Request::Read { .. } if !is_success(code) => {
                ExchangeOutcome::ApplicationFailure(format!("response code {}", code_text(code)))
            }
            Request::Read { resource_type } => {
                if response.payload.is_empty() {
                    error!("invalid data of len 0");
                }
                match codec::decode(resource_type, &response.payload) {
                    Ok(value) => ExchangeOutcome::Value(value),
                    Err(e) => {
                        error!("cannot decode {} response: {}", resource_type, e);
                        ExchangeOutcome::ApplicationFailure(e.to_string())
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coap_lite::ResponseType;

    #[test]
    fn test_terminal_states() {
        assert!(!ExchangeState::Idle.is_terminal());
        assert!(!ExchangeState::Sent.is_terminal());
        assert!(ExchangeState::Completed.is_terminal());
        assert!(ExchangeState::Failed.is_terminal());
        assert!(ExchangeState::Aborted.is_terminal());
    }

    #[test]
    fn test_outcome_success() {
        assert!(ExchangeOutcome::Value(Value::Int32(1)).is_success());
        assert!(ExchangeOutcome::Written(MessageClass::Response(ResponseType::Changed)).is_success());
        assert!(!ExchangeOutcome::TransportFailure("reset".into()).is_success());
        assert!(!ExchangeOutcome::Aborted.is_success());
    }
}
