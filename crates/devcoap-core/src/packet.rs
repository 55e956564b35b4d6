//! CoAP packets
//!
//! Wire framing is `coap_lite`'s. This module adds what both sides of the
//! service share on top of it: reply constructors, the Uri-Path and
//! Content-Format accessors, and the mapping of framing errors into [`Error`].

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, ResponseType};

use crate::error::{Error, Result};

/// Longest token a packet may carry
pub const MAX_TOKEN_LEN: usize = 8;

/// Longest Content-Format option value (a uint of at most two bytes)
pub const MAX_CONTENT_FORMAT_LEN: usize = 2;

/// A packet with the given type, code and message id and no token
pub fn new_packet(mtype: MessageType, code: MessageClass, message_id: u16) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_type(mtype);
    packet.header.code = code;
    packet.header.message_id = message_id;
    packet
}

/// Empty ACK for a received confirmable message
pub fn empty_ack(message_id: u16) -> Packet {
    new_packet(MessageType::Acknowledgement, MessageClass::Empty, message_id)
}

/// Reset for a message that cannot be processed
pub fn reset(message_id: u16) -> Packet {
    new_packet(MessageType::Reset, MessageClass::Empty, message_id)
}

/// Response to `request`: piggybacked on the ACK for CON, NON otherwise.
pub fn response_to(request: &Packet, code: ResponseType, message_id: u16) -> Packet {
    let (mtype, mid) = match request.header.get_type() {
        MessageType::Confirmable => (MessageType::Acknowledgement, request.header.message_id),
        _ => (MessageType::NonConfirmable, message_id),
    };
    let mut response = new_packet(mtype, MessageClass::Response(code), mid);
    response.set_token(request.get_token().to_vec());
    response
}

/// Parse a datagram
pub fn decode(data: &[u8]) -> Result<Packet> {
    Packet::from_bytes(data).map_err(|e| Error::Message(e.to_string()))
}

/// Serialize a packet
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    let tkl = packet.get_token().len();
    if tkl > MAX_TOKEN_LEN {
        return Err(Error::Message(format!(
            "token of {} bytes exceeds {}",
            tkl, MAX_TOKEN_LEN
        )));
    }
    packet.to_bytes().map_err(|e| Error::Message(e.to_string()))
}

/// Class digit of a code: 0 request, 2 success, 4 client error, 5 server error
pub fn code_class(code: MessageClass) -> u8 {
    u8::from(code) >> 5
}

/// `class.detail` form used in logs, e.g. `4.04`
pub fn code_text(code: MessageClass) -> String {
    let raw = u8::from(code);
    format!("{}.{:02}", raw >> 5, raw & 0x1F)
}

pub fn is_success(code: MessageClass) -> bool {
    matches!(code, MessageClass::Response(_)) && code_class(code) == 2
}

/// Accessors the service needs beyond what [`Packet`] offers
pub trait PacketExt {
    fn message_type(&self) -> MessageType;

    /// Code 0.00: an empty ACK, RST or ping
    fn is_empty_message(&self) -> bool;

    fn is_request(&self) -> bool;

    fn is_response(&self) -> bool;

    /// Append one Uri-Path option per segment
    fn set_uri_segments<S: AsRef<str>>(&mut self, segments: &[S]);

    /// Uri-Path option values joined by `/`, without a leading slash
    fn uri_path_string(&self) -> String;

    /// Content-Format option, `None` when absent.
    ///
    /// A value longer than two bytes is not a valid format and is an error
    /// rather than a truncated number.
    fn content_format_number(&self) -> Result<Option<u16>>;

    fn set_content_format_number(&mut self, format: u16);

    fn with_token(self, token: Vec<u8>) -> Self
    where
        Self: Sized;

    fn with_payload(self, payload: impl Into<Vec<u8>>) -> Self
    where
        Self: Sized;
}

impl PacketExt for Packet {
    fn message_type(&self) -> MessageType {
        self.header.get_type()
    }

    fn is_empty_message(&self) -> bool {
        self.header.code == MessageClass::Empty
    }

    fn is_request(&self) -> bool {
        matches!(self.header.code, MessageClass::Request(_))
    }

    fn is_response(&self) -> bool {
        matches!(self.header.code, MessageClass::Response(_))
    }

    fn set_uri_segments<S: AsRef<str>>(&mut self, segments: &[S]) {
        for seg in segments {
            self.add_option(CoapOption::UriPath, seg.as_ref().as_bytes().to_vec());
        }
    }

    fn uri_path_string(&self) -> String {
        self.get_option(CoapOption::UriPath)
            .map(|values| {
                values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default()
    }

    fn content_format_number(&self) -> Result<Option<u16>> {
        let Some(value) = self
            .get_option(CoapOption::ContentFormat)
            .and_then(|values| values.front())
        else {
            return Ok(None);
        };
        if value.len() > MAX_CONTENT_FORMAT_LEN {
            return Err(Error::Message(format!(
                "content-format option of {} bytes",
                value.len()
            )));
        }
        Ok(Some(
            value.iter().fold(0u16, |acc, b| (acc << 8) | *b as u16),
        ))
    }

    fn set_content_format_number(&mut self, format: u16) {
        self.clear_option(CoapOption::ContentFormat);
        let bytes = format.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        self.add_option(CoapOption::ContentFormat, bytes[skip..].to_vec());
    }

    fn with_token(mut self, token: Vec<u8>) -> Self {
        self.set_token(token);
        self
    }

    fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}
