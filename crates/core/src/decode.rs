//! Decoder: parse a model's correction response and map it back onto
//! (snapshot, token) coordinates.
//!
//! Pure function of the response text and the batch's offset table. No
//! network, no retries; anything that is not one of the accepted shapes is a
//! structured parse failure, never a guess.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::encode::{BatchIndex, IndexSpace};
use crate::RESPONSE_PREVIEW_CHARS;

// Models routinely wrap the JSON they were asked for in a Markdown fence.
static FENCED_PAYLOAD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").unwrap());

/// Parse failure for a correction response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The response is not a JSON integer array, not a JSON object of
    /// string-encoded indices to readings, and not empty.
    #[error("unrecognized correction response shape: {preview:?}")]
    MalformedResponse { preview: String },
}

/// One correction resolved onto the original batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedCorrection {
    /// Position of the owning snapshot in the encoded batch slice.
    pub snapshot: usize,
    /// Position of the token within that snapshot.
    pub token: usize,
    /// Replacement reading, when the response supplied one.
    pub replacement: Option<String>,
}

/// Decoded correction set: what resolved, and what was rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrectionReport {
    pub corrections: Vec<ResolvedCorrection>,
    /// Indices that did not resolve against the batch. Excluded from the
    /// applied set; a stray index must never land on the wrong token.
    pub out_of_range: Vec<usize>,
}

impl CorrectionReport {
    pub fn is_empty(&self) -> bool {
        self.corrections.is_empty() && self.out_of_range.is_empty()
    }
}

/// Parse `response` and resolve each entry through `index` in the given
/// index space.
///
/// Accepted shapes: a JSON array of integers, a JSON object mapping
/// string-encoded integers to replacement readings, or either one empty. A
/// fenced response is unwrapped first; the accepted shapes are unchanged.
pub fn decode_corrections(
    response: &str,
    index: &BatchIndex,
    space: IndexSpace,
) -> Result<CorrectionReport, DecodeError> {
    let payload = extract_payload(response);
    let value: Value =
        serde_json::from_str(payload).map_err(|_| malformed(response))?;

    let entries: Vec<(usize, Option<String>)> = match value {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .map(|n| (n as usize, None))
                    .ok_or_else(|| malformed(response))
            })
            .collect::<Result<_, _>>()?,
        Value::Object(map) => {
            let mut pairs: Vec<(usize, Option<String>)> = map
                .iter()
                .map(|(key, val)| {
                    let idx = key.parse::<usize>().map_err(|_| malformed(response))?;
                    let reading = val.as_str().ok_or_else(|| malformed(response))?;
                    Ok((idx, Some(reading.to_string())))
                })
                .collect::<Result<_, DecodeError>>()?;
            // Object key order is whatever the JSON map yields; report in
            // index order.
            pairs.sort_by_key(|(idx, _)| *idx);
            pairs
        }
        _ => return Err(malformed(response)),
    };

    let mut report = CorrectionReport::default();
    for (idx, replacement) in entries {
        match index.resolve(idx, space) {
            Some(entry) => report.corrections.push(ResolvedCorrection {
                snapshot: entry.snapshot,
                token: entry.token,
                replacement,
            }),
            None => {
                eprintln!(
                    "[furigana-audit] correction index {} out of range for batch of {} tokens",
                    idx,
                    index.token_count()
                );
                report.out_of_range.push(idx);
            }
        }
    }

    Ok(report)
}

fn extract_payload(response: &str) -> &str {
    match FENCED_PAYLOAD_RE.captures(response) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(""),
        None => response.trim(),
    }
}

fn malformed(response: &str) -> DecodeError {
    DecodeError::MalformedResponse {
        preview: response.chars().take(RESPONSE_PREVIEW_CHARS).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::EncodingStrategy;
    use crate::snapshot::{ReadingToken, Snapshot};

    fn two_token_batch() -> Vec<Snapshot> {
        vec![
            Snapshot {
                text: "黒猫".to_string(),
                tokens: vec![ReadingToken::new("黒", "くろ", 0, 1)],
            },
            Snapshot {
                text: "白犬".to_string(),
                tokens: vec![ReadingToken::new("白", "しろ", 0, 1)],
            },
        ]
    }

    #[test]
    fn test_empty_array_response() {
        let index = BatchIndex::new(&two_token_batch());
        let report = decode_corrections("[]", &index, IndexSpace::TokenOrdinal).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn test_empty_object_response() {
        let index = BatchIndex::new(&two_token_batch());
        let report = decode_corrections("{}", &index, IndexSpace::TokenOrdinal).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn test_array_with_out_of_range_index() {
        let index = BatchIndex::new(&two_token_batch());
        let report = decode_corrections("[0,5]", &index, IndexSpace::TokenOrdinal).unwrap();

        assert_eq!(report.corrections.len(), 1);
        assert_eq!(report.corrections[0].snapshot, 0);
        assert_eq!(report.corrections[0].token, 0);
        assert_eq!(report.corrections[0].replacement, None);
        assert_eq!(report.out_of_range, vec![5]);
    }

    #[test]
    fn test_object_with_replacement() {
        let index = BatchIndex::new(&two_token_batch());
        let report =
            decode_corrections(r#"{"1":"はく"}"#, &index, IndexSpace::TokenOrdinal).unwrap();

        assert_eq!(report.corrections.len(), 1);
        assert_eq!(report.corrections[0].snapshot, 1);
        assert_eq!(report.corrections[0].replacement.as_deref(), Some("はく"));
    }

    #[test]
    fn test_object_reported_in_index_order() {
        let index = BatchIndex::new(&two_token_batch());
        let report = decode_corrections(
            r#"{"1":"はく","0":"こく"}"#,
            &index,
            IndexSpace::TokenOrdinal,
        )
        .unwrap();

        let order: Vec<usize> = report.corrections.iter().map(|c| c.snapshot).collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn test_global_offset_space() {
        // Strategy fixes the index space: 3 is the second token's offset.
        let index = BatchIndex::new(&two_token_batch());
        let space = EncodingStrategy::GlobalOffsetCsv.index_space();

        let report = decode_corrections("[3]", &index, space).unwrap();
        assert_eq!(report.corrections.len(), 1);
        assert_eq!(report.corrections[0].snapshot, 1);

        // 1 is inside the first text but on no token start.
        let report = decode_corrections("[1]", &index, space).unwrap();
        assert!(report.corrections.is_empty());
        assert_eq!(report.out_of_range, vec![1]);
    }

    #[test]
    fn test_fenced_response() {
        let index = BatchIndex::new(&two_token_batch());
        let report = decode_corrections("```json\n[0]\n```", &index, IndexSpace::TokenOrdinal)
            .unwrap();
        assert_eq!(report.corrections.len(), 1);
    }

    #[test]
    fn test_prose_response_is_malformed() {
        let index = BatchIndex::new(&two_token_batch());
        let err = decode_corrections("the wrong tokens are 0 and 1", &index, IndexSpace::TokenOrdinal)
            .unwrap_err();

        match err {
            DecodeError::MalformedResponse { preview } => {
                assert!(preview.starts_with("the wrong tokens"));
            }
        }
    }

    #[test]
    fn test_non_integer_array_is_malformed() {
        let index = BatchIndex::new(&two_token_batch());
        assert!(decode_corrections(r#"["0"]"#, &index, IndexSpace::TokenOrdinal).is_err());
        assert!(decode_corrections("[0.5]", &index, IndexSpace::TokenOrdinal).is_err());
        assert!(decode_corrections("[-1]", &index, IndexSpace::TokenOrdinal).is_err());
    }

    #[test]
    fn test_non_string_object_value_is_malformed() {
        let index = BatchIndex::new(&two_token_batch());
        assert!(decode_corrections(r#"{"0":1}"#, &index, IndexSpace::TokenOrdinal).is_err());
        assert!(decode_corrections(r#"{"a":"かな"}"#, &index, IndexSpace::TokenOrdinal).is_err());
    }

    #[test]
    fn test_preview_is_bounded() {
        let index = BatchIndex::new(&two_token_batch());
        let long = "あ".repeat(500);
        let err = decode_corrections(&long, &index, IndexSpace::TokenOrdinal).unwrap_err();

        match err {
            DecodeError::MalformedResponse { preview } => {
                assert_eq!(preview.chars().count(), crate::RESPONSE_PREVIEW_CHARS);
            }
        }
    }
}
