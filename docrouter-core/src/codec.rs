use crate::error::RouterError;
use crate::msg::{BatchResult, BatchSlot, OperationSpec};
use crate::topology::TopologyDescriptor;
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    /// One JSON array holding every item
    #[default]
    JsonArray,
    /// One JSON document per line
    NewlineDelimited,
}

impl FrameFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            FrameFormat::JsonArray => "application/json",
            FrameFormat::NewlineDelimited => "application/x-ndjson",
        }
    }

    /// Pick a format from a response `Content-Type` header
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.contains("ndjson") || content_type.starts_with("text/plain") {
            FrameFormat::NewlineDelimited
        } else {
            FrameFormat::JsonArray
        }
    }
}

pub fn encode_batch_request(
    items: &[OperationSpec],
    format: FrameFormat,
) -> Result<Bytes, RouterError> {
    match format {
        FrameFormat::JsonArray => Ok(Bytes::from(serde_json::to_vec(items)?)),
        FrameFormat::NewlineDelimited => {
            let mut buf = BytesMut::new();
            for item in items {
                let json = serde_json::to_vec(item)?;
                buf.reserve(json.len() + 1);
                buf.put_slice(&json);
                buf.put_u8(b'\n');
            }
            Ok(buf.freeze())
        }
    }
}

/// Decode a composite response and check it lines up with the request.
///
/// A slot count different from `expected` fails the whole batch.
pub fn decode_batch_response(
    data: &[u8],
    format: FrameFormat,
    expected: usize,
) -> Result<BatchResult, RouterError> {
    let slots: Vec<BatchSlot> = match format {
        FrameFormat::JsonArray => serde_json::from_slice(data)
            .map_err(|e| RouterError::InvalidResponse(format!("batch body: {}", e)))?,
        FrameFormat::NewlineDelimited => {
            let mut slots = Vec::with_capacity(expected);
            for (n, line) in data.split(|&b| b == b'\n').enumerate() {
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                let slot = serde_json::from_slice(line).map_err(|e| {
                    RouterError::InvalidResponse(format!("batch line {}: {}", n + 1, e))
                })?;
                slots.push(slot);
            }
            slots
        }
    };

    check_cardinality(&slots, expected)?;
    Ok(slots)
}

pub fn check_cardinality(slots: &[BatchSlot], expected: usize) -> Result<(), RouterError> {
    if slots.len() != expected {
        return Err(RouterError::InvalidResponse(format!(
            "batch cardinality mismatch: sent {} item(s), received {} slot(s)",
            expected,
            slots.len()
        )));
    }
    Ok(())
}

pub fn decode_topology(data: &[u8]) -> Result<TopologyDescriptor, RouterError> {
    serde_json::from_slice(data)
        .map_err(|e| RouterError::InvalidResponse(format!("topology body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_array_request_preserves_order() {
        let items = vec![OperationSpec::get("/docs/1"), OperationSpec::get("/docs/2")];
        let bytes = encode_batch_request(&items, FrameFormat::JsonArray).unwrap();
        let back: Vec<OperationSpec> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, items);
    }

    #[test]
    fn test_ndjson_request_has_one_line_per_item() {
        let items = vec![OperationSpec::get("/a"), OperationSpec::get("/b")];
        let bytes = encode_batch_request(&items, FrameFormat::NewlineDelimited).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_decode_ndjson_response_skips_blank_lines() {
        let body = b"{\"kind\":\"ok\",\"status\":200,\"body\":1}\n\n{\"kind\":\"error\",\"status\":404,\"message\":\"gone\"}\n";
        let slots = decode_batch_response(body, FrameFormat::NewlineDelimited, 2).unwrap();
        assert_eq!(slots[0], BatchSlot::ok(json!(1)));
        assert!(!slots[1].is_ok());
    }

    #[test]
    fn test_cardinality_mismatch_fails_batch() {
        let body = serde_json::to_vec(&vec![BatchSlot::ok(json!(1))]).unwrap();
        let err = decode_batch_response(&body, FrameFormat::JsonArray, 2).unwrap_err();
        assert!(err.to_string().contains("cardinality"));
    }

    #[test]
    fn test_garbage_is_invalid_response() {
        let err = decode_batch_response(b"not json", FrameFormat::JsonArray, 1).unwrap_err();
        assert!(matches!(err, RouterError::InvalidResponse(_)));
        assert!(matches!(
            decode_topology(b"{}"),
            Err(RouterError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_format_from_content_type() {
        assert_eq!(
            FrameFormat::from_content_type("application/x-ndjson"),
            FrameFormat::NewlineDelimited
        );
        assert_eq!(
            FrameFormat::from_content_type("application/json; charset=utf-8"),
            FrameFormat::JsonArray
        );
    }
}
