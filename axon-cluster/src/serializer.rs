//! Envelope serialization, HMAC authentication, and length-prefix framing
//!
//! Wire layout: `u32 big-endian length` followed by `length` bytes of JSON
//! envelope. When a cluster secret is configured the envelope carries an
//! HMAC-SHA256 digest over a canonical rendering (recursively sorted object
//! keys) of the authenticated fields, so sender and receiver compute
//! identical digests regardless of map iteration order.

use crate::error::{ClusterError, ClusterResult};
use crate::message::ClusterMessage;
use axon_core::NodeId;
use bytes::{Buf, BytesMut};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Current wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Default upper bound on a single frame. The source protocol leaves the
/// cap unspecified; 64 MiB is far above any legitimate control message.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const FRAME_HEADER_LEN: usize = 4;

/// The wire wrapper around a cluster message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub from: NodeId,
    pub timestamp: u64,
    pub payload: ClusterMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Serializes, authenticates, frames, and reverses all of it
#[derive(Debug, Clone)]
pub struct MessageSerializer {
    secret: Option<Vec<u8>>,
    max_frame_size: usize,
}

impl MessageSerializer {
    pub fn new(secret: Option<String>, max_frame_size: usize) -> Self {
        Self {
            secret: secret.map(|s| s.into_bytes()),
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Build and serialize an envelope around a payload
    pub fn serialize(&self, payload: &ClusterMessage, from: &NodeId) -> ClusterResult<Vec<u8>> {
        let timestamp = Utc::now().timestamp_millis() as u64;
        let payload_value = serde_json::to_value(payload)
            .map_err(|e| ClusterError::serialize(e.to_string()))?;

        let hmac = match &self.secret {
            Some(secret) => Some(self.compute_hmac(
                secret,
                PROTOCOL_VERSION,
                from,
                timestamp,
                &payload_value,
            )),
            None => None,
        };

        let envelope = Envelope {
            version: PROTOCOL_VERSION,
            from: from.clone(),
            timestamp,
            payload: payload.clone(),
            hmac,
        };
        serde_json::to_vec(&envelope).map_err(|e| ClusterError::serialize(e.to_string()))
    }

    /// Decode and authenticate an envelope
    pub fn deserialize(&self, bytes: &[u8]) -> ClusterResult<Envelope> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| ClusterError::deserialize(e.to_string()))?;

        if envelope.version != PROTOCOL_VERSION {
            return Err(ClusterError::deserialize(format!(
                "unknown protocol version {}",
                envelope.version
            )));
        }

        if let Some(secret) = &self.secret {
            let provided = envelope
                .hmac
                .as_deref()
                .ok_or_else(|| ClusterError::deserialize("missing hmac"))?;
            let payload_value = serde_json::to_value(&envelope.payload)
                .map_err(|e| ClusterError::deserialize(e.to_string()))?;
            let expected = self.compute_hmac(
                secret,
                envelope.version,
                &envelope.from,
                envelope.timestamp,
                &payload_value,
            );
            if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
                return Err(ClusterError::deserialize("hmac mismatch"));
            }
        }

        Ok(envelope)
    }

    /// Prefix a payload with its big-endian length
    pub fn frame(&self, payload: &[u8]) -> ClusterResult<Vec<u8>> {
        if payload.is_empty() {
            return Err(ClusterError::serialize("refusing to frame empty payload"));
        }
        if payload.len() > self.max_frame_size {
            return Err(ClusterError::serialize(format!(
                "frame of {} bytes exceeds cap of {}",
                payload.len(),
                self.max_frame_size
            )));
        }
        let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        Ok(framed)
    }

    /// Extract the next complete frame from an accumulation buffer.
    ///
    /// Returns `Ok(None)` when fewer than `4 + length` bytes are buffered so
    /// the caller can read more data and retry; partial frames stay in the
    /// buffer untouched.
    pub fn unframe(&self, buf: &mut BytesMut) -> ClusterResult<Option<Vec<u8>>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length == 0 {
            return Err(ClusterError::deserialize("zero-length frame"));
        }
        if length > self.max_frame_size {
            return Err(ClusterError::deserialize(format!(
                "frame of {} bytes exceeds cap of {}",
                length, self.max_frame_size
            )));
        }
        if buf.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }
        buf.advance(FRAME_HEADER_LEN);
        let payload = buf.split_to(length);
        Ok(Some(payload.to_vec()))
    }

    fn compute_hmac(
        &self,
        secret: &[u8],
        version: u8,
        from: &NodeId,
        timestamp: u64,
        payload: &Value,
    ) -> String {
        let mut canonical = String::new();
        canonical.push_str("{\"from\":");
        write_canonical(&Value::String(from.to_string()), &mut canonical);
        canonical.push_str(",\"payload\":");
        write_canonical(payload, &mut canonical);
        canonical.push_str(&format!(
            ",\"timestamp\":{},\"version\":{}}}",
            timestamp, version
        ));

        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(canonical.as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }
}

impl Default for MessageSerializer {
    fn default() -> Self {
        Self::new(None, DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Write a JSON value with object keys in sorted order, producing the same
/// bytes on every node regardless of insertion order.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&serde_json::to_string(other).expect("scalar serializes"));
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    fn heartbeat() -> ClusterMessage {
        ClusterMessage::Heartbeat {
            process_count: 7,
            uptime_ms: 1234,
        }
    }

    #[test]
    fn serialize_deserialize_is_identity() {
        let serializer = MessageSerializer::default();
        let from = node("a@h:4369");

        let bytes = serializer.serialize(&heartbeat(), &from).unwrap();
        let envelope = serializer.deserialize(&bytes).unwrap();

        assert_eq!(envelope.version, PROTOCOL_VERSION);
        assert_eq!(envelope.from, from);
        assert!(envelope.hmac.is_none());
        match envelope.payload {
            ClusterMessage::Heartbeat {
                process_count,
                uptime_ms,
            } => {
                assert_eq!(process_count, 7);
                assert_eq!(uptime_ms, 1234);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn hmac_round_trip_and_tamper_detection() {
        let serializer = MessageSerializer::new(Some("s3cret".to_string()), DEFAULT_MAX_FRAME_SIZE);
        let from = node("a@h:4369");

        let bytes = serializer.serialize(&heartbeat(), &from).unwrap();
        let envelope = serializer.deserialize(&bytes).unwrap();
        assert!(envelope.hmac.is_some());

        // Tampering with the payload breaks authentication.
        let mut tampered: Value = serde_json::from_slice(&bytes).unwrap();
        tampered["payload"]["process_count"] = json!(999);
        let tampered_bytes = serde_json::to_vec(&tampered).unwrap();
        let err = serializer.deserialize(&tampered_bytes).unwrap_err();
        assert!(matches!(err, ClusterError::Deserialize(_)));
    }

    #[test]
    fn missing_hmac_is_rejected_when_secret_is_configured() {
        let plain = MessageSerializer::default();
        let secured = MessageSerializer::new(Some("k".to_string()), DEFAULT_MAX_FRAME_SIZE);
        let from = node("a@h:4369");

        let bytes = plain.serialize(&heartbeat(), &from).unwrap();
        let err = secured.deserialize(&bytes).unwrap_err();
        assert!(matches!(err, ClusterError::Deserialize(_)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let alice = MessageSerializer::new(Some("alice".to_string()), DEFAULT_MAX_FRAME_SIZE);
        let bob = MessageSerializer::new(Some("bob".to_string()), DEFAULT_MAX_FRAME_SIZE);
        let from = node("a@h:4369");

        let bytes = alice.serialize(&heartbeat(), &from).unwrap();
        assert!(bob.deserialize(&bytes).is_err());
        assert!(alice.deserialize(&bytes).is_ok());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let serializer = MessageSerializer::default();
        let from = node("a@h:4369");
        let bytes = serializer.serialize(&heartbeat(), &from).unwrap();

        let mut value: Value = serde_json::from_slice(&bytes).unwrap();
        value["version"] = json!(9);
        let err = serializer
            .deserialize(&serde_json::to_vec(&value).unwrap())
            .unwrap_err();
        assert!(matches!(err, ClusterError::Deserialize(_)));
    }

    #[test]
    fn canonical_form_ignores_key_order() {
        let mut a = String::new();
        let mut b = String::new();
        write_canonical(&json!({"b": 1, "a": {"y": 2, "x": [1, 2]}}), &mut a);
        write_canonical(&json!({"a": {"x": [1, 2], "y": 2}, "b": 1}), &mut b);
        assert_eq!(a, b);
        assert_eq!(a, r#"{"a":{"x":[1,2],"y":2},"b":1}"#);
    }

    #[test]
    fn frame_unframe_round_trip() {
        let serializer = MessageSerializer::default();
        let payload = b"hello frames".to_vec();

        let framed = serializer.frame(&payload).unwrap();
        assert_eq!(framed.len(), 4 + payload.len());

        let mut buf = BytesMut::from(&framed[..]);
        let out = serializer.unframe(&mut buf).unwrap().unwrap();
        assert_eq!(out, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn unframe_is_restartable_across_partial_reads() {
        let serializer = MessageSerializer::default();
        let first = serializer.frame(b"first").unwrap();
        let second = serializer.frame(b"second").unwrap();

        let mut stream: Vec<u8> = Vec::new();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);

        let mut buf = BytesMut::new();
        let mut decoded: Vec<Vec<u8>> = Vec::new();
        // Feed one byte at a time; every complete frame pops out in order.
        for byte in stream {
            buf.extend_from_slice(&[byte]);
            while let Some(payload) = serializer.unframe(&mut buf).unwrap() {
                decoded.push(payload);
            }
        }
        assert_eq!(decoded, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn zero_and_oversized_frames_are_rejected() {
        let serializer = MessageSerializer::new(None, 16);

        let mut buf = BytesMut::from(&0u32.to_be_bytes()[..]);
        assert!(serializer.unframe(&mut buf).is_err());

        let mut buf = BytesMut::from(&100u32.to_be_bytes()[..]);
        assert!(serializer.unframe(&mut buf).is_err());

        assert!(serializer.frame(&[0u8; 17]).is_err());
        assert!(serializer.frame(&[]).is_err());
    }
}
