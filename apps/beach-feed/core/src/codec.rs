use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::action::{Action, ActionKind, ActionQuery};

/// Inbound frame that could not be turned into an [`Action`].
#[derive(Debug, Error)]
pub enum MalformedFrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame must be a JSON object")]
    NotAnObject,
    #[error("frame is missing a string action_type")]
    MissingActionType,
    #[error("frame has an invalid field: {0}")]
    InvalidField(#[source] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    action_type: String,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    query: Option<ActionQuery>,
}

/// Decodes one inbound payload into an [`Action`].
pub fn decode_action(bytes: &[u8]) -> Result<Action, MalformedFrameError> {
    let value: Value = serde_json::from_slice(bytes).map_err(MalformedFrameError::InvalidJson)?;
    let object = match &value {
        Value::Object(object) => object,
        _ => return Err(MalformedFrameError::NotAnObject),
    };
    if !matches!(object.get("action_type"), Some(Value::String(_))) {
        return Err(MalformedFrameError::MissingActionType);
    }

    let frame: InboundFrame =
        serde_json::from_value(value).map_err(MalformedFrameError::InvalidField)?;

    // Older clients send an empty string rather than omitting the field.
    let product_id = frame.product_id.filter(|id| !id.trim().is_empty());

    Ok(Action {
        kind: ActionKind::parse(frame.action_type.trim()),
        product_id,
        query: frame.query,
    })
}

/// A catalog record. Opaque apart from its `product_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Product(Map<String, Value>);

impl Product {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// A record carrying nothing but its identifier.
    pub fn from_id(product_id: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("product_id".into(), Value::String(product_id.into()));
        Self(fields)
    }

    pub fn product_id(&self) -> Option<&str> {
        self.0.get("product_id").and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: u16,
    pub message: String,
}

impl StatusMessage {
    pub const BAD_REQUEST: u16 = 400;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;

    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Self::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_SERVER_ERROR, message)
    }
}

/// Everything the feed pushes to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Batch(Vec<Product>),
    Status(StatusMessage),
}

impl OutboundMessage {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"status":500,"message":"Failed to encode message"}"#.to_vec()
        })
    }

    pub fn as_batch(&self) -> Option<&[Product]> {
        match self {
            OutboundMessage::Batch(products) => Some(products),
            OutboundMessage::Status(_) => None,
        }
    }

    pub fn as_status(&self) -> Option<&StatusMessage> {
        match self {
            OutboundMessage::Status(status) => Some(status),
            OutboundMessage::Batch(_) => None,
        }
    }
}

impl From<StatusMessage> for OutboundMessage {
    fn from(status: StatusMessage) -> Self {
        OutboundMessage::Status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn decodes_swipe_with_product() {
        let action = decode_action(br#"{"action_type":"like","product_id":"p1"}"#).unwrap();
        assert_eq!(action.kind, ActionKind::Like);
        assert_eq!(action.product_id.as_deref(), Some("p1"));
        assert!(action.query.is_none());
    }

    #[test_timeout::timeout]
    fn decodes_query_payload() {
        let action = decode_action(
            br#"{"action_type":"open","query":{"text":"boots","filter":{"category":"shoes"}}}"#,
        )
        .unwrap();
        assert_eq!(action.kind, ActionKind::Open);
        let query = action.scoped_query().expect("query present");
        assert_eq!(query.text.as_deref(), Some("boots"));
        assert_eq!(
            query.filter.as_ref().and_then(|f| f.get("category")),
            Some(&Value::String("shoes".into()))
        );
    }

    #[test_timeout::timeout]
    fn empty_product_id_is_dropped() {
        let action = decode_action(br#"{"action_type":"open","product_id":""}"#).unwrap();
        assert!(action.product_id.is_none());
    }

    #[test_timeout::timeout]
    fn rejects_malformed_frames() {
        assert!(matches!(
            decode_action(b"not json"),
            Err(MalformedFrameError::InvalidJson(_))
        ));
        assert!(matches!(
            decode_action(br#"["open"]"#),
            Err(MalformedFrameError::NotAnObject)
        ));
        assert!(matches!(
            decode_action(br#"{"product_id":"p1"}"#),
            Err(MalformedFrameError::MissingActionType)
        ));
        assert!(matches!(
            decode_action(br#"{"action_type":7}"#),
            Err(MalformedFrameError::MissingActionType)
        ));
        assert!(matches!(
            decode_action(br#"{"action_type":"open","query":{"filter":"category"}}"#),
            Err(MalformedFrameError::InvalidField(_))
        ));
    }

    #[test_timeout::timeout]
    fn encodes_batch_as_array() {
        let message = OutboundMessage::Batch(vec![Product::from_id("p1"), Product::from_id("p2")]);
        let value: Value = serde_json::from_slice(&message.encode()).unwrap();
        assert_eq!(
            value,
            serde_json::json!([{"product_id": "p1"}, {"product_id": "p2"}])
        );
    }

    #[test_timeout::timeout]
    fn encodes_status_envelope() {
        let message: OutboundMessage = StatusMessage::bad_request("open first").into();
        let value: Value = serde_json::from_slice(&message.encode()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"status": 400, "message": "open first"})
        );
    }
}
