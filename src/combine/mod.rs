//! Merging partial endpoint responses into one client response.
//!
//! Binary (miniSEED) and text outputs combine by streaming concatenation;
//! JSON arrays and StationXML require the whole set of partials before a
//! coherent document can be emitted.

pub mod stationxml;

use crate::error::FederatorError;
use bytes::Bytes;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combiner {
    /// Concatenation in submission order (miniSEED, raw bytes).
    Raw,
    /// Keep the first partial's header line, drop headers of the rest.
    Text,
    /// Concatenate the element lists of the partial JSON arrays.
    JsonArray,
    /// Merge `Network`/`Station` trees into one document.
    StationXml,
}

impl Combiner {
    /// Whether partials can be forwarded as they arrive. Buffered formats
    /// need every partial before emitting a single byte.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Combiner::Raw | Combiner::Text)
    }

    /// Buffered merge of non-empty partials.
    pub fn combine(&self, parts: Vec<Bytes>) -> Result<Bytes, FederatorError> {
        match self {
            Combiner::Raw => Ok(concat(parts)),
            Combiner::Text => Ok(combine_text(parts)),
            Combiner::JsonArray => combine_json_arrays(parts),
            Combiner::StationXml => stationxml::merge(parts),
        }
    }
}

fn concat(parts: Vec<Bytes>) -> Bytes {
    let mut out = Vec::with_capacity(parts.iter().map(Bytes::len).sum());
    for part in parts {
        out.extend_from_slice(&part);
    }
    Bytes::from(out)
}

fn combine_text(parts: Vec<Bytes>) -> Bytes {
    let mut out = Vec::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i == 0 {
            out.extend_from_slice(&part);
        } else {
            out.extend_from_slice(strip_header_line(&part));
        }
        if !out.is_empty() && !out.ends_with(b"\n") {
            out.push(b'\n');
        }
    }
    Bytes::from(out)
}

/// Everything after the first newline; the whole slice when there is none.
fn strip_header_line(part: &[u8]) -> &[u8] {
    match part.iter().position(|&b| b == b'\n') {
        Some(pos) => &part[pos + 1..],
        None => b"",
    }
}

fn combine_json_arrays(parts: Vec<Bytes>) -> Result<Bytes, FederatorError> {
    let mut elements = Vec::new();
    for part in parts {
        match serde_json::from_slice::<serde_json::Value>(&part) {
            Ok(serde_json::Value::Array(items)) => elements.extend(items),
            Ok(_) => warn!("combine: dropping non-array json partial"),
            Err(e) => warn!("combine: dropping malformed json partial: {}", e),
        }
    }
    let body = serde_json::to_vec(&serde_json::Value::Array(elements))
        .map_err(|e| FederatorError::Internal(format!("json serialization failed: {}", e)))?;
    Ok(Bytes::from(body))
}

/// Chunk filter for streaming text combination: drops bytes up to and
/// including the first newline of a non-first partial.
pub struct TextHeaderStripper {
    skipping: bool,
}

impl TextHeaderStripper {
    /// `first` — whether this partial is the first one of the response.
    pub fn new(first: bool) -> Self {
        Self { skipping: !first }
    }

    pub fn filter(&mut self, chunk: Bytes) -> Bytes {
        if !self.skipping {
            return chunk;
        }
        match chunk.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                self.skipping = false;
                chunk.slice(pos + 1..)
            }
            None => Bytes::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_concat_preserves_order() {
        let combined = Combiner::Raw
            .combine(vec![Bytes::from("aaa"), Bytes::from("bbb")])
            .unwrap();
        assert_eq!(&combined[..], b"aaabbb");
    }

    #[test]
    fn test_text_drops_subsequent_headers() {
        let a = Bytes::from("#Network|Station\nGR|WET\n");
        let b = Bytes::from("#Network|Station\nCH|DAVOX\n");
        let combined = Combiner::Text.combine(vec![a, b]).unwrap();
        assert_eq!(
            &combined[..],
            b"#Network|Station\nGR|WET\nCH|DAVOX\n".as_slice()
        );
    }

    #[test]
    fn test_json_arrays_concatenate() {
        let a = Bytes::from(r#"[{"n": 1}, {"n": 2}]"#);
        let b = Bytes::from(r#"[{"n": 3}]"#);
        let combined = Combiner::JsonArray.combine(vec![a, b]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&combined).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_json_malformed_partial_dropped() {
        let a = Bytes::from(r#"[{"n": 1}]"#);
        let b = Bytes::from("not json");
        let combined = Combiner::JsonArray.combine(vec![a, b]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&combined).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_header_stripper_across_chunk_boundary() {
        let mut stripper = TextHeaderStripper::new(false);
        assert_eq!(&stripper.filter(Bytes::from("#Net|"))[..], b"");
        assert_eq!(&stripper.filter(Bytes::from("Sta\nGR|"))[..], b"GR|");
        assert_eq!(&stripper.filter(Bytes::from("WET\n"))[..], b"WET\n");
    }

    #[test]
    fn test_header_stripper_passes_first_partial() {
        let mut stripper = TextHeaderStripper::new(true);
        assert_eq!(
            &stripper.filter(Bytes::from("#Net|Sta\n"))[..],
            b"#Net|Sta\n".as_slice()
        );
    }
}
