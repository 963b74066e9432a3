//! Frame types for the control WebSocket
//!
//! Every message on the wire is one JSON object `{"type": ..., "data": ...}`.
//! Field names inside `data` are camelCase; this is an externally visible
//! schema shared with the broker, so the serde attributes here are load-
//! bearing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One logical message on the control WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Frame {
    Request(RequestPayload),
    Response(ResponsePayload),
    Chunk(ChunkPayload),
    SseStart(SseStartPayload),
    SseChunk(SseChunkPayload),
    SseEnd(SseEndPayload),
    Ping(PingPayload),
    Pong(PingPayload),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Request(_) => FrameKind::Request,
            Frame::Response(_) => FrameKind::Response,
            Frame::Chunk(_) => FrameKind::Chunk,
            Frame::SseStart(_) => FrameKind::SseStart,
            Frame::SseChunk(_) => FrameKind::SseChunk,
            Frame::SseEnd(_) => FrameKind::SseEnd,
            Frame::Ping(_) => FrameKind::Ping,
            Frame::Pong(_) => FrameKind::Pong,
        }
    }
}

/// Discriminant of a [`Frame`], used as the `originalType` tag on chunks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FrameKind {
    Request,
    Response,
    Chunk,
    SseStart,
    SseChunk,
    SseEnd,
    Ping,
    Pong,
}

/// An HTTP request pushed down from the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// The origin's answer, sent back up to the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub id: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub is_base64: bool,
}

/// A slice of a larger logical frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub message_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub chunk: String,
    pub original_type: FrameKind,
}

/// Opens a server-sent-events stream for one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SseStartPayload {
    pub request_id: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SseChunkPayload {
    pub request_id: String,
    pub chunk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SseEndPayload {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Keepalive probe in either direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PingPayload {
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let json = r#"{"type":"request","data":{"id":"r1","method":"GET","path":"/ping","headers":{}}}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();

        match &frame {
            Frame::Request(req) => {
                assert_eq!(req.id, "r1");
                assert_eq!(req.method, "GET");
                assert_eq!(req.path, "/ping");
                assert!(req.headers.is_empty());
                assert!(req.body.is_none());
            }
            other => panic!("Expected request frame, got {:?}", other),
        }
    }

    #[test]
    fn test_response_wire_shape() {
        let frame = Frame::Response(ResponsePayload {
            id: "r1".to_string(),
            status: 200,
            headers: HashMap::from([("content-type".to_string(), "text/plain".to_string())]),
            body: "pong".to_string(),
            is_base64: false,
        });

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["data"]["id"], "r1");
        assert_eq!(value["data"]["status"], 200);
        assert_eq!(value["data"]["isBase64"], false);
        assert_eq!(value["data"]["headers"]["content-type"], "text/plain");
    }

    #[test]
    fn test_chunk_wire_shape() {
        let frame = Frame::Chunk(ChunkPayload {
            message_id: "1712000000000-a1b2c3d4e".to_string(),
            chunk_index: 0,
            total_chunks: 2,
            chunk: "{\"type\":".to_string(),
            original_type: FrameKind::Response,
        });

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "chunk");
        assert_eq!(value["data"]["messageId"], "1712000000000-a1b2c3d4e");
        assert_eq!(value["data"]["chunkIndex"], 0);
        assert_eq!(value["data"]["totalChunks"], 2);
        assert_eq!(value["data"]["originalType"], "response");
    }

    #[test]
    fn test_sse_frames_use_kebab_case_tags() {
        let start = Frame::SseStart(SseStartPayload {
            request_id: "r9".to_string(),
            status: 200,
            headers: HashMap::new(),
        });
        let end = Frame::SseEnd(SseEndPayload {
            request_id: "r9".to_string(),
            reason: Some("stream_ended".to_string()),
        });

        assert_eq!(serde_json::to_value(&start).unwrap()["type"], "sse-start");
        let end_value = serde_json::to_value(&end).unwrap();
        assert_eq!(end_value["type"], "sse-end");
        assert_eq!(end_value["data"]["requestId"], "r9");
        assert_eq!(end_value["data"]["reason"], "stream_ended");
    }

    #[test]
    fn test_sse_end_omits_missing_reason() {
        let end = Frame::SseEnd(SseEndPayload {
            request_id: "r9".to_string(),
            reason: None,
        });
        let value = serde_json::to_value(&end).unwrap();
        assert!(value["data"].get("reason").is_none());
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let ping = Frame::Ping(PingPayload { timestamp: 12345 });
        let json = serde_json::to_string(&ping).unwrap();
        assert_eq!(json, r#"{"type":"ping","data":{"timestamp":12345}}"#);

        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ping);
        assert_eq!(parsed.kind(), FrameKind::Ping);
    }
}
