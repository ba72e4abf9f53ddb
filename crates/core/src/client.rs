//! Model-call boundary: the normalized reply shape and the audit round trip.
//!
//! The generative SDK's response nesting changes between versions; the
//! [`ModelReply::from_json`] adapter is the one place that knows about it.
//! Everything past this module sees only `{text, usageMetadata?}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decode::{decode_corrections, CorrectionReport, DecodeError};
use crate::encode::{encode_batch, BatchIndex, EncodingStrategy};
use crate::prompt::build_audit_prompt;
use crate::snapshot::Snapshot;
use crate::{LanguageModel, ModelError};

/// Token accounting reported by the service, when available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_token_count: Option<u64>,
}

/// Normalized model reply: the generated text plus optional usage accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelReply {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
}

impl ModelReply {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage_metadata: None,
        }
    }

    /// Normalize a raw SDK response into the reply contract.
    ///
    /// Accepts either a flattened `{"text": ...}` or the service's
    /// `candidates[0].content.parts[*].text` nesting; `usageMetadata` is read
    /// from the top level when present. A shape with neither text location
    /// yields an empty `text`, which the decoder then rejects with the usual
    /// parse failure.
    pub fn from_json(value: &Value) -> Self {
        let text = match value.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => candidate_text(value).unwrap_or_default(),
        };

        let usage_metadata = value
            .get("usageMetadata")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        Self {
            text,
            usage_metadata,
        }
    }
}

fn candidate_text(value: &Value) -> Option<String> {
    let parts = value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;

    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Failure of one audit round trip.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The model call itself failed; the transport error is carried verbatim
    /// behind the subsystem prefix. Not retried.
    #[error("language model call failed: {0}")]
    Model(ModelError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Result of one completed audit round trip.
#[derive(Debug, Clone)]
pub struct AuditReport {
    pub prompt: String,
    pub reply: ModelReply,
    pub report: CorrectionReport,
}

/// Run one audit over a captured batch: encode, prompt, call, decode.
///
/// Returns `Ok(None)` without touching the model when the batch encodes to
/// nothing; an audit over an empty batch would be a billable no-op. The caller passes a snapshot *copy* (see
/// [`SnapshotStore::get_snapshots`](crate::SnapshotStore::get_snapshots)) so
/// the page mutating underneath cannot change the batch mid-flight.
pub fn run_audit<M: LanguageModel>(
    snapshots: &[Snapshot],
    strategy: EncodingStrategy,
    model: &M,
) -> Result<Option<AuditReport>, AuditError> {
    let encoded = encode_batch(snapshots, strategy);
    if encoded.is_empty() {
        return Ok(None);
    }

    let prompt = build_audit_prompt(&encoded, strategy);
    let reply = model.generate(&prompt).map_err(AuditError::Model)?;

    let index = BatchIndex::new(snapshots);
    let report = decode_corrections(&reply.text, &index, strategy.index_space())?;

    Ok(Some(AuditReport {
        prompt,
        reply,
        report,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ReadingToken;
    use std::cell::{Cell, RefCell};

    /// Scripted model for tests: returns a fixed response, counts calls.
    struct ScriptedModel {
        response: &'static str,
        calls: Cell<usize>,
        last_prompt: RefCell<String>,
    }

    impl ScriptedModel {
        fn new(response: &'static str) -> Self {
            Self {
                response,
                calls: Cell::new(0),
                last_prompt: RefCell::new(String::new()),
            }
        }
    }

    impl LanguageModel for ScriptedModel {
        fn generate(&self, prompt: &str) -> Result<ModelReply, ModelError> {
            self.calls.set(self.calls.get() + 1);
            *self.last_prompt.borrow_mut() = prompt.to_string();
            Ok(ModelReply::new(self.response))
        }
    }

    struct FailingModel;

    impl LanguageModel for FailingModel {
        fn generate(&self, _prompt: &str) -> Result<ModelReply, ModelError> {
            Err("quota exceeded".into())
        }
    }

    fn batch() -> Vec<Snapshot> {
        vec![Snapshot {
            text: "振り仮名".to_string(),
            tokens: vec![
                ReadingToken::new("振", "ふ", 0, 1),
                ReadingToken::new("仮名", "かな", 2, 4),
            ],
        }]
    }

    #[test]
    fn test_empty_batch_skips_model_call() {
        let model = ScriptedModel::new("[]");
        let outcome = run_audit(&[], EncodingStrategy::PairList, &model).unwrap();

        assert!(outcome.is_none());
        assert_eq!(model.calls.get(), 0);
    }

    #[test]
    fn test_audit_round_trip() {
        let model = ScriptedModel::new("[1]");
        let outcome = run_audit(&batch(), EncodingStrategy::PairList, &model)
            .unwrap()
            .unwrap();

        assert_eq!(model.calls.get(), 1);
        assert_eq!(*model.last_prompt.borrow(), outcome.prompt);
        assert!(outcome.prompt.contains("振,ふ;仮名,かな;"));
        assert_eq!(outcome.report.corrections.len(), 1);
        assert_eq!(outcome.report.corrections[0].token, 1);
    }

    #[test]
    fn test_model_error_is_wrapped() {
        let err = run_audit(&batch(), EncodingStrategy::PairList, &FailingModel).unwrap_err();
        let message = err.to_string();

        assert!(message.starts_with("language model call failed:"));
        assert!(message.contains("quota exceeded"));
    }

    #[test]
    fn test_malformed_reply_propagates() {
        let model = ScriptedModel::new("sorry, I cannot help with that");
        let err = run_audit(&batch(), EncodingStrategy::PairList, &model).unwrap_err();

        assert!(matches!(err, AuditError::Decode(_)));
    }

    #[test]
    fn test_from_json_flat_text() {
        let value = serde_json::json!({ "text": "[]" });
        let reply = ModelReply::from_json(&value);

        assert_eq!(reply.text, "[]");
        assert!(reply.usage_metadata.is_none());
    }

    #[test]
    fn test_from_json_candidate_nesting() {
        let value = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "[0," }, { "text": "1]" }] }
            }],
            "usageMetadata": {
                "promptTokenCount": 120,
                "candidatesTokenCount": 8,
                "totalTokenCount": 128
            }
        });
        let reply = ModelReply::from_json(&value);

        assert_eq!(reply.text, "[0,1]");
        let usage = reply.usage_metadata.unwrap();
        assert_eq!(usage.prompt_token_count, Some(120));
        assert_eq!(usage.total_token_count, Some(128));
    }

    #[test]
    fn test_from_json_unknown_shape() {
        let value = serde_json::json!({ "message": "ok" });
        let reply = ModelReply::from_json(&value);

        assert_eq!(reply.text, "");
    }
}
