//! Node.js bindings for the furigana auditor core.
//!
//! The extension's content script owns one `SnapshotStore` per tab, feeds it
//! from the tokenizer pipeline, and pulls encoded batches / decodes model
//! responses through these bindings. The actual model call stays on the JS
//! side of the boundary; the core is transport-agnostic.

use napi::bindgen_prelude::*;
use napi_derive::napi;
use std::sync::Mutex;

use furigana_auditor_core::{
    build_audit_prompt, build_review_prompt, capture_to_csv, decode_corrections, encode_batch,
    BatchIndex, EncodingStrategy, ModelReply as CoreReply, SnapshotStore as CoreStore,
    APPROX_CHARS_PER_TOKEN, DEFAULT_STRATEGY,
};

/// One reading annotation on a text node.
#[napi(object)]
pub struct ReadingToken {
    /// The kanji substring being annotated.
    pub original: String,
    /// The kana reading currently assigned to it.
    pub reading: String,
    /// Start offset in the owning text, in characters (inclusive).
    pub start: u32,
    /// End offset in the owning text, in characters (exclusive).
    pub end: u32,
    /// Advisory tokenizer flag; the audit ignores it.
    pub is_filtered: Option<bool>,
}

impl From<ReadingToken> for furigana_auditor_core::ReadingToken {
    fn from(token: ReadingToken) -> Self {
        Self {
            original: token.original,
            reading: token.reading,
            start: token.start as usize,
            end: token.end as usize,
            is_filtered: token.is_filtered.unwrap_or(false),
        }
    }
}

/// One correction resolved onto the captured batch.
#[napi(object)]
pub struct ResolvedCorrection {
    pub snapshot: u32,
    pub token: u32,
    pub replacement: Option<String>,
}

/// Decoded correction set for one response.
#[napi(object)]
pub struct CorrectionReport {
    pub corrections: Vec<ResolvedCorrection>,
    /// Indices the model returned that matched no token; never applied.
    pub out_of_range: Vec<u32>,
}

impl From<furigana_auditor_core::CorrectionReport> for CorrectionReport {
    fn from(report: furigana_auditor_core::CorrectionReport) -> Self {
        Self {
            corrections: report
                .corrections
                .into_iter()
                .map(|c| ResolvedCorrection {
                    snapshot: c.snapshot as u32,
                    token: c.token as u32,
                    replacement: c.replacement,
                })
                .collect(),
            out_of_range: report.out_of_range.into_iter().map(|i| i as u32).collect(),
        }
    }
}

/// Token accounting from the model service, when reported.
#[napi(object)]
pub struct UsageMetadata {
    pub prompt_token_count: Option<u32>,
    pub candidates_token_count: Option<u32>,
    pub total_token_count: Option<u32>,
}

/// Normalized model reply.
#[napi(object)]
pub struct ModelReply {
    pub text: String,
    pub usage_metadata: Option<UsageMetadata>,
}

impl From<CoreReply> for ModelReply {
    fn from(reply: CoreReply) -> Self {
        Self {
            text: reply.text,
            usage_metadata: reply.usage_metadata.map(|u| UsageMetadata {
                prompt_token_count: u.prompt_token_count.map(|v| v as u32),
                candidates_token_count: u.candidates_token_count.map(|v| v as u32),
                total_token_count: u.total_token_count.map(|v| v as u32),
            }),
        }
    }
}

fn parse_strategy(name: Option<String>) -> Result<EncodingStrategy> {
    match name {
        Some(name) => name.parse().map_err(Error::from_reason),
        None => Ok(DEFAULT_STRATEGY),
    }
}

/// Buffers the furigana generated on the current page for a later audit.
///
/// One instance per content-script session (per tab); cleared on navigation.
#[napi]
pub struct SnapshotStore {
    inner: Mutex<CoreStore>,
}

#[napi]
impl SnapshotStore {
    #[napi(constructor)]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CoreStore::new()),
        }
    }

    /// Save one snapshot (one text node and its tokens).
    ///
    /// Empty text or an empty token list is silently dropped.
    #[napi]
    pub fn add_snapshot(&self, text: String, tokens: Vec<ReadingToken>) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::from_reason("Lock poisoned"))?;
        inner.add_snapshot(text, tokens.into_iter().map(Into::into).collect());
        Ok(())
    }

    /// Drop all stored snapshots for the current page.
    #[napi]
    pub fn clear_snapshots(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::from_reason("Lock poisoned"))?;
        inner.clear_snapshots();
        Ok(())
    }

    /// Number of stored snapshots.
    #[napi]
    pub fn snapshot_count(&self) -> Result<u32> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::from_reason("Lock poisoned"))?;
        Ok(inner.len() as u32)
    }

    /// Encode the stored batch with the given strategy (deployment default
    /// when omitted). Returns "" when there is nothing to audit; callers must
    /// then skip the model call.
    #[napi]
    pub fn encode(&self, strategy: Option<String>) -> Result<String> {
        let strategy = parse_strategy(strategy)?;
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::from_reason("Lock poisoned"))?;
        Ok(encode_batch(&inner.get_snapshots(), strategy))
    }

    /// Build the full audit prompt for the stored batch.
    ///
    /// Returns "" when there is nothing to audit.
    #[napi]
    pub fn build_audit_prompt(&self, strategy: Option<String>) -> Result<String> {
        let strategy = parse_strategy(strategy)?;
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::from_reason("Lock poisoned"))?;

        let encoded = encode_batch(&inner.get_snapshots(), strategy);
        if encoded.is_empty() {
            return Ok(String::new());
        }
        Ok(build_audit_prompt(&encoded, strategy))
    }

    /// Build the human-review listing of the stored readings.
    #[napi]
    pub fn build_review_prompt(&self) -> Result<String> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::from_reason("Lock poisoned"))?;
        Ok(build_review_prompt(&inner.get_snapshots()))
    }

    /// Decode a model response against the stored batch.
    ///
    /// The strategy must be the one the prompt was encoded with; it fixes the
    /// index space the response is interpreted in.
    #[napi]
    pub fn decode_response(
        &self,
        response: String,
        strategy: Option<String>,
    ) -> Result<CorrectionReport> {
        let strategy = parse_strategy(strategy)?;
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::from_reason("Lock poisoned"))?;

        let snapshots = inner.get_snapshots();
        let index = BatchIndex::new(&snapshots);
        decode_corrections(&response, &index, strategy.index_space())
            .map(Into::into)
            .map_err(|e| Error::from_reason(e.to_string()))
    }

    /// Export the stored batch as capture CSV for the offline pipeline.
    #[napi]
    pub fn export_capture_csv(&self) -> Result<String> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::from_reason("Lock poisoned"))?;
        capture_to_csv(&inner.get_snapshots()).map_err(|e| Error::from_reason(e.to_string()))
    }

    /// Dump the stored batch as JSON, for debugging or further processing.
    #[napi]
    pub fn export_snapshots_json(&self) -> Result<String> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::from_reason("Lock poisoned"))?;
        serde_json::to_string(&inner.get_snapshots()).map_err(|e| Error::from_reason(e.to_string()))
    }
}

/// Normalize a raw model SDK response (JSON string) into `{text, usageMetadata?}`.
///
/// This is the only place that knows about the SDK's response nesting; keep
/// extension code on this instead of reaching into the response object.
#[napi]
pub fn parse_model_reply(response_json: String) -> Result<ModelReply> {
    let value: serde_json::Value = serde_json::from_str(&response_json)
        .map_err(|e| Error::from_reason(format!("invalid response JSON: {}", e)))?;
    Ok(CoreReply::from_json(&value).into())
}

/// Helper function: estimate prompt tokens using character approximation.
#[napi]
pub fn estimate_tokens(text: String) -> u32 {
    (text.len() / APPROX_CHARS_PER_TOKEN) as u32
}
