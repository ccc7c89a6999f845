//! Text form of protocol messages on the shared channel.
//!
//! An entry is `<kind>|<envelope>` where the envelope is a JSON object
//! carrying the id, sender, timestamp and the kind-specific content. The kind
//! sits outside the JSON so readers can skip kinds they don't understand
//! without parsing the content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;
use crate::models::{Message, MessageKind, Payload};

const SEPARATOR: char = '|';

#[derive(Serialize)]
struct EnvelopeOut<'a> {
  id: &'a str,
  sender_id: &'a str,
  timestamp: &'a DateTime<Utc>,
  content: Value,
}

#[derive(Deserialize)]
struct EnvelopeIn {
  id: String,
  sender_id: String,
  timestamp: DateTime<Utc>,
  #[serde(default)]
  content: Value,
}

pub fn encode(message: &Message) -> Result<String, serde_json::Error> {
  let envelope = EnvelopeOut {
    id: &message.id,
    sender_id: &message.sender_id,
    timestamp: &message.timestamp,
    content: message.payload.content()?,
  };
  let body = serde_json::to_string(&envelope)?;
  Ok(format!("{}{SEPARATOR}{body}", message.payload.tag()))
}

pub fn decode(entry: &str) -> Result<Message, DecodeError> {
  let (tag, body) = entry.split_once(SEPARATOR).ok_or(DecodeError::MissingSeparator)?;
  let tag = tag.trim();
  if tag.is_empty() {
    return Err(DecodeError::EmptyKind);
  }
  let envelope: EnvelopeIn = serde_json::from_str(body).map_err(DecodeError::Envelope)?;
  let payload = payload_from_parts(tag, envelope.content)?;
  Ok(Message {
    id: envelope.id,
    sender_id: envelope.sender_id,
    timestamp: envelope.timestamp,
    payload,
  })
}

fn payload_from_parts(tag: &str, content: Value) -> Result<Payload, DecodeError> {
  let content_err = |source| DecodeError::Content { kind: tag.to_string(), source };
  let payload = match MessageKind::from_tag(tag) {
    MessageKind::LeaderElection => Payload::LeaderElection(serde_json::from_value(content).map_err(content_err)?),
    MessageKind::NodeAnnounce => Payload::NodeAnnounce(serde_json::from_value(content).map_err(content_err)?),
    MessageKind::TasksData => Payload::TasksData(serde_json::from_value(content).map_err(content_err)?),
    MessageKind::Claim => Payload::Claim(serde_json::from_value(content).map_err(content_err)?),
    MessageKind::Progress => Payload::Progress(serde_json::from_value(content).map_err(content_err)?),
    MessageKind::Heartbeat => Payload::Heartbeat(serde_json::from_value(content).map_err(content_err)?),
    MessageKind::Unknown => Payload::Unknown { kind: tag.to_string(), content },
  };
  Ok(payload)
}
