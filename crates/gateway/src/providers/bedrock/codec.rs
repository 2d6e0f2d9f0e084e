//! AWS Bedrock event-stream binary framing (§4.1 "Bedrock specifics").
//!
//! Each frame is `[4-byte big-endian total length | headers | JSON body | CRC]`.
//! The 80-byte padding target for encoded frames is replicated exactly from
//! the upstream reference and must not be re-derived (§9 open question a;
//! see `DESIGN.md`).

use shared::error::CommonError;

/// Target minimum body length (header bytes + JSON body) an encoded frame is
/// padded to, via the synthetic `p` field. Fixed by the upstream reference;
/// do not change without re-reading §9(a).
const PADDING_TARGET_BYTES: usize = 80;
/// Reserved for event-stream overhead (length prefix, header block, CRC)
/// that isn't itself part of the padded body.
const PADDING_OVERHEAD_BYTES: usize = 10;
const PADDING_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A decoded logical event: the `:event-type` header value and its parsed
/// JSON body, with the synthetic `p` padding field stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct BedrockEvent {
    pub event_type: String,
    pub message_type: Option<String>,
    pub content_type: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    AwaitLength,
    AwaitBody { total_len: u32 },
}

/// Incremental decoder for a byte stream that may deliver frames split at
/// arbitrary boundaries (§8 scenario 4: "feed the decoder a byte stream
/// split mid-frame"). Only two states: waiting for the 4-byte length prefix,
/// or waiting for the rest of a frame whose length is known.
pub struct BedrockStreamDecoder {
    state: DecoderState,
    buffer: Vec<u8>,
}

impl Default for BedrockStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BedrockStreamDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::AwaitLength,
            buffer: Vec::new(),
        }
    }

    /// Feed newly received bytes in; returns every complete frame that
    /// became available, in order, with no extras and no bytes dropped.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<BedrockEvent>, CommonError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            match self.state {
                DecoderState::AwaitLength => {
                    if self.buffer.len() < 4 {
                        break;
                    }
                    let total_len = u32::from_be_bytes([
                        self.buffer[0],
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                    ]);
                    self.state = DecoderState::AwaitBody { total_len };
                }
                DecoderState::AwaitBody { total_len } => {
                    if (self.buffer.len() as u64) < total_len as u64 {
                        break;
                    }
                    let frame: Vec<u8> = self.buffer.drain(0..total_len as usize).collect();
                    events.push(decode_frame(&frame)?);
                    self.state = DecoderState::AwaitLength;
                }
            }
        }

        Ok(events)
    }

    /// True once every pushed byte has been consumed into a complete frame.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.state == DecoderState::AwaitLength
    }
}

/// Decode exactly one complete frame (length prefix included).
fn decode_frame(frame: &[u8]) -> Result<BedrockEvent, CommonError> {
    if frame.len() < 4 + 4 {
        return Err(CommonError::InvalidResponse {
            msg: "bedrock event-stream frame shorter than minimum header".to_string(),
            source: None,
        });
    }
    let headers_len =
        u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    let headers_start = 12; // 4-byte total length + 4-byte headers length + 4-byte prelude CRC
    let headers_end = headers_start + headers_len;
    if headers_end + 4 > frame.len() {
        return Err(CommonError::InvalidResponse {
            msg: "bedrock event-stream frame header length exceeds frame".to_string(),
            source: None,
        });
    }
    let body_end = frame.len() - 4; // trailing message CRC
    let headers = decode_headers(&frame[headers_start..headers_end])?;
    let body_bytes = &frame[headers_end..body_end];
    let mut body: serde_json::Value = serde_json::from_slice(body_bytes).map_err(|e| {
        CommonError::InvalidResponse {
            msg: format!("bedrock event-stream body was not valid JSON: {e}"),
            source: None,
        }
    })?;
    if let Some(obj) = body.as_object_mut() {
        obj.remove("p");
    }

    let event_type = headers
        .get(":event-type")
        .cloned()
        .ok_or_else(|| CommonError::InvalidResponse {
            msg: "bedrock event-stream frame missing :event-type header".to_string(),
            source: None,
        })?;

    Ok(BedrockEvent {
        event_type,
        message_type: headers.get(":message-type").cloned(),
        content_type: headers.get(":content-type").cloned(),
        body,
    })
}

/// Headers are a flat sequence of `[name_len: u8][name][7 (string type
/// marker)][value_len: u16 BE][value]` records; values here are always
/// strings, matching the three headers this codec reads.
fn decode_headers(mut bytes: &[u8]) -> Result<std::collections::HashMap<String, String>, CommonError> {
    let mut headers = std::collections::HashMap::new();
    let err = || CommonError::InvalidResponse {
        msg: "malformed bedrock event-stream header block".to_string(),
        source: None,
    };

    while !bytes.is_empty() {
        let name_len = *bytes.first().ok_or_else(err)? as usize;
        bytes = &bytes[1..];
        if bytes.len() < name_len {
            return Err(err());
        }
        let name = String::from_utf8(bytes[..name_len].to_vec()).map_err(|_| err())?;
        bytes = &bytes[name_len..];

        let _value_type = *bytes.first().ok_or_else(err)?;
        bytes = &bytes[1..];
        if bytes.len() < 2 {
            return Err(err());
        }
        let value_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        bytes = &bytes[2..];
        if bytes.len() < value_len {
            return Err(err());
        }
        let value = String::from_utf8(bytes[..value_len].to_vec()).map_err(|_| err())?;
        bytes = &bytes[value_len..];

        headers.insert(name, value);
    }

    Ok(headers)
}

fn encode_headers(headers: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in headers {
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(7u8); // string type marker
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

/// Deterministic padding value: `max(0, 80 - bodyLen - 10)` characters drawn
/// from the 62-char alphabet, truncated to the alphabet size (§4.1 "Encode
/// (passthrough)").
pub fn padding_for(body_len: usize) -> String {
    let target = PADDING_TARGET_BYTES.saturating_sub(body_len + PADDING_OVERHEAD_BYTES);
    let len = target.min(PADDING_ALPHABET.len());
    PADDING_ALPHABET[..len].iter().map(|&b| b as char).collect()
}

/// Encode one frame for passthrough re-emission, injecting the `p` padding
/// field into the body before framing.
pub fn encode_frame(event_type: &str, body: &serde_json::Value) -> Result<Vec<u8>, CommonError> {
    let mut padded_body = body.clone();
    let unpadded_json = serde_json::to_vec(&padded_body)?;
    let padding = padding_for(unpadded_json.len());
    if let Some(obj) = padded_body.as_object_mut() {
        obj.insert("p".to_string(), serde_json::Value::String(padding));
    }
    let body_bytes = serde_json::to_vec(&padded_body)?;

    let header_bytes = encode_headers(&[
        (":event-type", event_type),
        (":message-type", "event"),
        (":content-type", "application/json"),
    ]);

    let headers_len = header_bytes.len() as u32;
    let prelude_len = 4u32 /* total length */ + 4 /* headers length */;
    let total_len = prelude_len + 4 /* prelude crc */ + headers_len + body_bytes.len() as u32 + 4 /* message crc */;

    let mut frame = Vec::with_capacity(total_len as usize);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&headers_len.to_be_bytes());
    frame.extend_from_slice(&crc32(&frame).to_be_bytes()); // prelude CRC over the two length fields
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(&body_bytes);
    frame.extend_from_slice(&crc32(&frame).to_be_bytes()); // message CRC over everything before it

    Ok(frame)
}

/// Decode a single, already-complete frame (convenience wrapper around
/// `decode_frame` for callers that aren't streaming).
pub fn decode_event(frame: &[u8]) -> Result<BedrockEvent, CommonError> {
    decode_frame(frame)
}

/// CRC32 (IEEE 802.3), used for both the event-stream prelude and message
/// checksums.
fn crc32(bytes: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB88320;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (POLY & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn padding_matches_worked_example() {
        // bodyLen=0 => pad_len = max(0, 80-0-10) = 70, but capped by alphabet len (62).
        assert_eq!(padding_for(0).len(), 62);
        // bodyLen=50 => pad_len = max(0, 80-50-10) = 20.
        assert_eq!(padding_for(50).len(), 20);
        // bodyLen=70 => pad_len = max(0, 80-70-10) = 0.
        assert_eq!(padding_for(70).len(), 0);
        assert_eq!(padding_for(1000).len(), 0);
    }

    #[test]
    fn encode_decode_round_trips() {
        let body = json!({ "delta": { "text": "hello" } });
        let frame = encode_frame("contentBlockDelta", &body).unwrap();
        let decoded = decode_event(&frame).unwrap();
        assert_eq!(decoded.event_type, "contentBlockDelta");
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn frame_length_prefix_matches_actual_length() {
        let frame = encode_frame("messageStop", &json!({})).unwrap();
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len());
    }

    #[test]
    fn decoder_reassembles_frame_split_mid_length_prefix() {
        let frame = encode_frame("messageStart", &json!({ "role": "assistant" })).unwrap();
        let mut decoder = BedrockStreamDecoder::new();

        let mut events = decoder.push(&frame[..3]).unwrap();
        assert!(events.is_empty());
        events.extend(decoder.push(&frame[3..]).unwrap());

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "messageStart");
        assert!(decoder.is_empty());
    }

    #[test]
    fn decoder_emits_multiple_frames_in_order_with_no_extras() {
        let f1 = encode_frame("messageStart", &json!({ "i": 1 })).unwrap();
        let f2 = encode_frame("contentBlockDelta", &json!({ "i": 2 })).unwrap();
        let f3 = encode_frame("messageStop", &json!({ "i": 3 })).unwrap();
        let mut stream = Vec::new();
        stream.extend_from_slice(&f1);
        stream.extend_from_slice(&f2[..5]);
        let mut decoder = BedrockStreamDecoder::new();
        let mut events = decoder.push(&stream).unwrap();
        events.extend(decoder.push(&f2[5..]).unwrap());
        events.extend(decoder.push(&f3).unwrap());

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, "messageStart");
        assert_eq!(events[1].event_type, "contentBlockDelta");
        assert_eq!(events[2].event_type, "messageStop");
        assert!(decoder.is_empty());
    }
}
