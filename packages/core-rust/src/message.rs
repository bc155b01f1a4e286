//! Queue message model.
//!
//! A [`QueueMessage`] is one *delivery* of a queued unit of work. The same
//! logical message (identified by [`MessageId`]) may be delivered many times;
//! each delivery carries a fresh [`ReceiptHandle`], and only the latest handle
//! can extend, release, or delete the message.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a logical message, shared by all of its deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token identifying one specific delivery of a message.
///
/// Required to extend or delete the delivery. A redelivery issues a new
/// handle and invalidates the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(pub String);

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed message attribute value.
///
/// Queues carry attributes as either string or number data types; numbers
/// are kept in their textual form so no precision is lost in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Number(serde_json::Number),
}

impl AttributeValue {
    /// Returns the value rendered as a string, regardless of its data type.
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            AttributeValue::String(s) => s.clone(),
            AttributeValue::Number(n) => n.to_string(),
        }
    }

    /// Returns the string payload, or `None` for numeric attributes.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            AttributeValue::Number(_) => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        AttributeValue::Number(value.into())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Number(value.into())
    }
}

/// One delivery of a queued message. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Identifier shared by every delivery of this message.
    pub message_id: MessageId,
    /// Raw message body.
    pub body: String,
    /// Handle for this specific delivery.
    pub receipt_handle: ReceiptHandle,
    /// Job-type-specific metadata.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// How many times the queue has handed this message out, including this
    /// delivery, when the queue exposes it.
    #[serde(default)]
    pub delivery_count: Option<u32>,
}

impl QueueMessage {
    /// Looks up an attribute by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Resolves the job identifier carried by this message.
    ///
    /// The attribute named `attribute` wins when present and non-blank;
    /// otherwise the trimmed body is used. Returns `None` when neither
    /// yields a non-empty identifier.
    #[must_use]
    pub fn job_reference(&self, attribute: &str) -> Option<String> {
        job_reference(&self.body, &self.attributes, attribute)
    }
}

/// Job identifier for a message body and attribute set; see
/// [`QueueMessage::job_reference`].
#[must_use]
pub fn job_reference(
    body: &str,
    attributes: &BTreeMap<String, AttributeValue>,
    attribute: &str,
) -> Option<String> {
    let from_attr = attributes
        .get(attribute)
        .map(AttributeValue::as_text)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    from_attr.or_else(|| {
        let body = body.trim();
        (!body.is_empty()).then(|| body.to_string())
    })
}
