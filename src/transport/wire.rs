//! Frame <-> wire message codec
//!
//! Ids and rates travel as string attributes; the payload is the raw JPEG
//! unless the transport needs text, in which case it is base64.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::MalformedMessage;
use crate::source::frame::Frame;
use crate::transport::WireMessage;

pub const ATTR_FRAME_ID: &str = "frame_id";
pub const ATTR_FRAME_RATE: &str = "frame_rate";
pub const ATTR_END_OF_STREAM: &str = "end_of_stream";
pub const ATTR_ENCODING: &str = "encoding";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Binary,
    Base64,
}

/// What a decoded wire message means to the consumer
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Frame(Frame),
    /// No id at or above `end_id` will ever be sent
    EndOfStream { end_id: u64 },
}

pub fn encode_frame(ordering_key: &str, frame: &Frame, encoding: PayloadEncoding) -> WireMessage {
    let mut attributes = BTreeMap::new();
    attributes.insert(ATTR_FRAME_ID.to_owned(), frame.id.to_string());
    attributes.insert(ATTR_FRAME_RATE.to_owned(), frame.rate.to_string());

    let data = match encoding {
        PayloadEncoding::Binary => frame.payload.clone(),
        PayloadEncoding::Base64 => {
            attributes.insert(ATTR_ENCODING.to_owned(), "base64".to_owned());
            Bytes::from(STANDARD.encode(&frame.payload))
        }
    };

    WireMessage {
        ordering_key: ordering_key.to_owned(),
        attributes,
        data,
    }
}

pub fn encode_end_of_stream(ordering_key: &str, end_id: u64, rate: f64) -> WireMessage {
    let mut attributes = BTreeMap::new();
    attributes.insert(ATTR_FRAME_ID.to_owned(), end_id.to_string());
    attributes.insert(ATTR_FRAME_RATE.to_owned(), rate.to_string());
    attributes.insert(ATTR_END_OF_STREAM.to_owned(), "true".to_owned());

    WireMessage {
        ordering_key: ordering_key.to_owned(),
        attributes,
        data: Bytes::new(),
    }
}

pub fn decode(message: &WireMessage) -> Result<WireEvent, MalformedMessage> {
    let id_raw = attribute(message, ATTR_FRAME_ID)?;
    let id = id_raw
        .trim()
        .parse::<u64>()
        .map_err(|_| MalformedMessage::InvalidAttribute {
            name: ATTR_FRAME_ID,
            value: id_raw.to_owned(),
        })?;

    if message
        .attributes
        .get(ATTR_END_OF_STREAM)
        .is_some_and(|v| v == "true")
    {
        return Ok(WireEvent::EndOfStream { end_id: id });
    }
    // Reserved: a frame there would leave no id for the end marker
    if id == u64::MAX {
        return Err(MalformedMessage::InvalidAttribute {
            name: ATTR_FRAME_ID,
            value: id_raw.to_owned(),
        });
    }

    let rate_raw = attribute(message, ATTR_FRAME_RATE)?;
    let rate = match rate_raw.trim().parse::<f64>() {
        Ok(rate) if rate.is_finite() && rate > 0.0 => rate,
        _ => {
            return Err(MalformedMessage::InvalidAttribute {
                name: ATTR_FRAME_RATE,
                value: rate_raw.to_owned(),
            })
        }
    };

    let payload = match message.attributes.get(ATTR_ENCODING).map(String::as_str) {
        None | Some("binary") => message.data.clone(),
        Some("base64") => Bytes::from(STANDARD.decode(&message.data)?),
        Some(other) => {
            return Err(MalformedMessage::InvalidAttribute {
                name: ATTR_ENCODING,
                value: other.to_owned(),
            })
        }
    };

    Ok(WireEvent::Frame(Frame { id, payload, rate }))
}

fn attribute<'a>(message: &'a WireMessage, name: &'static str) -> Result<&'a str, MalformedMessage> {
    message
        .attributes
        .get(name)
        .map(String::as_str)
        .ok_or(MalformedMessage::MissingAttribute(name))
}
