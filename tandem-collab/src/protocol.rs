//! JSON wire protocol spoken over WebSocket at `/ws`.
//!
//! Every frame is a JSON object with a `type` tag and a `timestamp` (ms
//! since epoch); most also carry an `id` for correlation. Message bodies
//! are flattened beside the envelope fields:
//!
//! ```text
//! { "type": "operation", "timestamp": 1712345678901,
//!   "documentId": "doc-1",
//!   "operation": { "id": "op-...", "clientId": "...", ... } }
//! ```
//!
//! Unknown fields inside operation payloads survive decode/encode, which
//! keeps older coordinators transparent to newer clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tandem_ot::{now_millis, ClientId, DocumentId, Operation, OperationId, Schema, Version};

use crate::presence::Presence;

/// WebSocket endpoint path on the coordinator.
pub const WS_PATH: &str = "/ws";

/// Identity attached to an authenticated connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub client_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl ClientInfo {
    pub fn anonymous(client_id: impl Into<ClientId>) -> Self {
        ClientInfo {
            client_id: client_id.into(),
            user_id: None,
            name: None,
            avatar: None,
        }
    }
}

/// Error codes carried by `error` and `operation_failed` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    DocumentNotFound,
    InvalidOperation,
    RateLimited,
    ServerError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::DocumentNotFound => "DOCUMENT_NOT_FOUND",
            ErrorCode::InvalidOperation => "INVALID_OPERATION",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ServerError => "SERVER_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Authenticate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    JoinDocument {
        document_id: DocumentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Schema>,
    },
    LeaveDocument {
        document_id: DocumentId,
    },
    Operation {
        document_id: DocumentId,
        operation: Operation,
    },
    PresenceUpdate {
        document_id: DocumentId,
        presence: Presence,
    },
    Ping,
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    AuthRequired,
    AuthSuccess {
        client_info: ClientInfo,
    },
    AuthFailed {
        reason: String,
    },
    DocumentJoined {
        document_id: DocumentId,
        version: Version,
        state: Value,
        schema: Schema,
        users: Vec<Presence>,
    },
    DocumentLeft {
        document_id: DocumentId,
    },
    DocumentState {
        document_id: DocumentId,
        version: Version,
        state: Value,
    },
    Operation {
        document_id: DocumentId,
        operation: Operation,
    },
    OperationApplied {
        document_id: DocumentId,
        operation_id: OperationId,
        version: Version,
    },
    OperationFailed {
        document_id: DocumentId,
        operation_id: OperationId,
        code: ErrorCode,
        message: String,
    },
    PresenceUpdate {
        document_id: DocumentId,
        presence: Presence,
    },
    PresenceState {
        document_id: DocumentId,
        users: Vec<Presence>,
    },
    UserJoined {
        document_id: DocumentId,
        user: Presence,
    },
    UserLeft {
        document_id: DocumentId,
        client_id: ClientId,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong,
}

/// Envelope wrapping a client message with the common frame fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(flatten)]
    pub msg: ClientMessage,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ClientEnvelope {
    pub fn new(msg: ClientMessage) -> Self {
        ClientEnvelope {
            msg,
            timestamp: now_millis(),
            id: None,
        }
    }

    pub fn with_id(msg: ClientMessage, id: impl Into<String>) -> Self {
        ClientEnvelope {
            msg,
            timestamp: now_millis(),
            id: Some(id.into()),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Envelope wrapping a server message with the common frame fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(flatten)]
    pub msg: ServerMessage,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ServerEnvelope {
    pub fn new(msg: ServerMessage) -> Self {
        ServerEnvelope {
            msg,
            timestamp: now_millis(),
            id: None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol-level failures.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    UnexpectedMessage(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedMessage(t) => write!(f, "Unexpected message: {t}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_ot::OpBody;

    #[test]
    fn test_authenticate_roundtrip() {
        let env = ClientEnvelope::new(ClientMessage::Authenticate {
            client_id: Some("client-1".into()),
            token: Some("secret".into()),
        });
        let raw = env.encode().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "authenticate");
        assert_eq!(value["clientId"], "client-1");
        assert!(value["timestamp"].as_u64().unwrap() > 0);

        let decoded = ClientEnvelope::decode(&raw).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_join_document_schema_optional() {
        let raw = json!({
            "type": "join_document",
            "documentId": "doc-1",
            "timestamp": 7
        })
        .to_string();
        let env = ClientEnvelope::decode(&raw).unwrap();
        assert_eq!(
            env.msg,
            ClientMessage::JoinDocument {
                document_id: "doc-1".into(),
                schema: None,
            }
        );

        let with_schema = json!({
            "type": "join_document",
            "documentId": "doc-1",
            "schema": "text",
            "timestamp": 7
        })
        .to_string();
        let env = ClientEnvelope::decode(&with_schema).unwrap();
        assert_eq!(
            env.msg,
            ClientMessage::JoinDocument {
                document_id: "doc-1".into(),
                schema: Some(Schema::Text),
            }
        );
    }

    #[test]
    fn test_operation_message_preserves_unknown_fields() {
        let raw = json!({
            "type": "operation",
            "documentId": "doc-1",
            "timestamp": 9,
            "operation": {
                "id": "op-1", "clientId": "c1", "baseVersion": 3,
                "type": "text-insert", "timestamp": 8,
                "position": 0, "text": "hi",
                "pluginHint": "bold"
            }
        })
        .to_string();
        let env = ClientEnvelope::decode(&raw).unwrap();
        let ClientMessage::Operation { operation, .. } = &env.msg else {
            panic!("expected operation message");
        };
        assert_eq!(operation.extra["pluginHint"], "bold");

        let reencoded: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(reencoded["operation"]["pluginHint"], "bold");
    }

    #[test]
    fn test_ping_pong_unit_variants() {
        let ping = ClientEnvelope::new(ClientMessage::Ping);
        let raw: Value = serde_json::from_str(&ping.encode().unwrap()).unwrap();
        assert_eq!(raw["type"], "ping");

        let pong = ServerEnvelope::new(ServerMessage::Pong);
        let raw: Value = serde_json::from_str(&pong.encode().unwrap()).unwrap();
        assert_eq!(raw["type"], "pong");
        assert!(raw["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_document_joined_roundtrip() {
        let env = ServerEnvelope::new(ServerMessage::DocumentJoined {
            document_id: "doc-1".into(),
            version: 12,
            state: json!("hello"),
            schema: Schema::Text,
            users: vec![Presence::new("c2")],
        });
        let raw = env.encode().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "document_joined");
        assert_eq!(value["documentId"], "doc-1");
        assert_eq!(value["version"], 12);
        assert_eq!(value["users"][0]["clientId"], "c2");

        let decoded = ServerEnvelope::decode(&raw).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_operation_applied_shape() {
        let env = ServerEnvelope::new(ServerMessage::OperationApplied {
            document_id: "doc-1".into(),
            operation_id: "op-9".into(),
            version: 4,
        });
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "operation_applied");
        assert_eq!(value["operationId"], "op-9");
        assert_eq!(value["version"], 4);
    }

    #[test]
    fn test_error_codes_screaming_snake() {
        let env = ServerEnvelope::new(ServerMessage::Error {
            code: ErrorCode::DocumentNotFound,
            message: "rejoin required".into(),
        });
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["code"], "DOCUMENT_NOT_FOUND");
        assert_eq!(ErrorCode::InvalidOperation.to_string(), "INVALID_OPERATION");
    }

    #[test]
    fn test_server_operation_roundtrip() {
        let op = Operation::new("c1", 2, OpBody::MapSet {
            key: "k".into(),
            value: json!([1, 2]),
            previous_value: None,
        });
        let env = ServerEnvelope::new(ServerMessage::Operation {
            document_id: "doc-1".into(),
            operation: op.clone(),
        });
        let decoded = ServerEnvelope::decode(&env.encode().unwrap()).unwrap();
        let ServerMessage::Operation { operation, .. } = decoded.msg else {
            panic!("expected operation");
        };
        assert_eq!(operation, op);
    }

    #[test]
    fn test_malformed_frame_rejected() {
        assert!(ClientEnvelope::decode("{\"type\":\"warp\"}").is_err());
        assert!(ClientEnvelope::decode("not json").is_err());
        assert!(ServerEnvelope::decode("{}").is_err());
    }

    #[test]
    fn test_envelope_correlation_id() {
        let env = ClientEnvelope::with_id(ClientMessage::Ping, "req-1");
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["id"], "req-1");
        let bare = ClientEnvelope::new(ClientMessage::Ping);
        let value: Value = serde_json::from_str(&bare.encode().unwrap()).unwrap();
        assert!(value.get("id").is_none());
    }
}
