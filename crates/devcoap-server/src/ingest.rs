//! Inbound reading ingestion
//!
//! Devices POST readings to `/a1r/{device-name}/{resource-name}`. Each request
//! is routed, its Content-Format checked against the resource's declared type,
//! its payload decoded, and the value handed to the delivery sink.
//!
//! | Outcome                        | Code |
//! |--------------------------------|------|
//! | reading delivered              | 2.04 |
//! | missing or undecodable payload | 4.00 |
//! | routing failure                | 4.04 |
//! | method other than POST         | 4.05 |
//! | Content-Format not accepted    | 4.15 |
//! | Content-Format over two bytes  | 4.15 |
//! | resource type has no codec     | 5.00 |

use bytes::Bytes;
use coap_lite::{MessageClass, Packet, RequestType, ResponseType};
use devcoap_core::packet::{self, code_text, PacketExt};
use devcoap_core::{codec, content_format, parse_path, CommandResult, Directory};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::sink::DeliverySink;

/// Diagnostic body of a 4.00 response
pub const MSG_PAYLOAD_INVALID: &str = "payload not valid";

/// Response code and body for one request
#[derive(Debug, Clone, PartialEq)]
pub struct IngestResponse {
    pub code: ResponseType,
    pub payload: Bytes,
}

impl IngestResponse {
    fn code(code: ResponseType) -> Self {
        Self {
            code,
            payload: Bytes::new(),
        }
    }

    fn invalid_payload() -> Self {
        Self {
            code: ResponseType::BadRequest,
            payload: Bytes::from_static(MSG_PAYLOAD_INVALID.as_bytes()),
        }
    }
}

/// Handles inbound requests against a directory and a sink
pub struct IngestHandler {
    directory: Arc<dyn Directory>,
    sink: Arc<dyn DeliverySink>,
}

impl IngestHandler {
    pub fn new(directory: Arc<dyn Directory>, sink: Arc<dyn DeliverySink>) -> Self {
        Self { directory, sink }
    }

    /// Decide the response to `request`, delivering its reading on success
    pub fn handle(&self, request: &Packet) -> IngestResponse {
        if request.header.code != MessageClass::Request(RequestType::Post) {
            debug!("rejecting {} request", code_text(request.header.code));
            return IngestResponse::code(ResponseType::MethodNotAllowed);
        }

        let identity = match parse_path(self.directory.as_ref(), &request.uri_path_string()) {
            Ok(identity) => identity,
            Err(e) => {
                info!("routing failed: {}", e);
                return IngestResponse::code(ResponseType::NotFound);
            }
        };

        if request.payload.is_empty() {
            info!("invalid data of len 0");
            return IngestResponse::invalid_payload();
        }

        let declared = &identity.resource.value_type;
        if !declared.is_supported() {
            error!("unsupported resource type {}", declared);
            return IngestResponse::code(ResponseType::InternalServerError);
        }

        let format = match request.content_format_number() {
            Ok(format) => format.unwrap_or(content_format::UNDEFINED),
            Err(e) => {
                info!("rejecting {}: {}", identity.resource_name(), e);
                return IngestResponse::code(ResponseType::UnsupportedContentFormat);
            }
        };
        if !declared.accepts_format(format) {
            debug!(
                "content-format {} not accepted for {} resource {}",
                format,
                declared,
                identity.resource_name()
            );
            return IngestResponse::code(ResponseType::UnsupportedContentFormat);
        }

        let value = match codec::decode(declared, &request.payload) {
            Ok(value) => value,
            Err(e) => {
                info!("invalid {} payload: {}", declared, e);
                return IngestResponse::invalid_payload();
            }
        };

        debug!(
            "posting reading {}/{} = {}",
            identity.device_name(),
            identity.resource_name(),
            value
        );
        self.sink.post_reading(
            identity.device_name(),
            identity.resource_name(),
            CommandResult::new(value),
        );
        IngestResponse::code(ResponseType::Changed)
    }

    /// Build the wire response to `request`: a piggybacked ACK for CON, a NON
    /// response carrying `message_id` otherwise
    pub fn respond(&self, request: &Packet, message_id: u16) -> Packet {
        let response = self.handle(request);
        packet::response_to(request, response.code, message_id)
            .with_payload(response.payload.to_vec())
    }
}
