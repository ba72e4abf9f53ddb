//! Core encode/decode logic for auditing furigana readings with a language model.
//!
//! This crate takes batches of reading snapshots (a text node's content plus
//! the kanji tokens annotated on it) and serializes them into compact prompt
//! payloads for a language-model audit. The matching decoder maps the model's
//! correction response back onto the exact (snapshot, token) coordinates the
//! payload was built from.

use std::error::Error;

/// Error type produced by [`LanguageModel`] implementations.
///
/// The core never inspects it; it is wrapped with a subsystem prefix and
/// propagated verbatim to the caller.
pub type ModelError = Box<dyn Error + Send + Sync>;

/// Trait for the generative-language service boundary.
///
/// Implementors perform one model call per invocation. The core issues no
/// retries and enforces no timeout; both belong to the transport behind the
/// implementation.
pub trait LanguageModel {
    /// Send one prompt and return the normalized reply.
    fn generate(&self, prompt: &str) -> Result<client::ModelReply, ModelError>;
}

// Blanket implementation for references to models
impl<T: LanguageModel + ?Sized> LanguageModel for &T {
    fn generate(&self, prompt: &str) -> Result<client::ModelReply, ModelError> {
        (*self).generate(prompt)
    }
}

mod client;
mod decode;
mod encode;
mod prompt;
mod snapshot;
pub mod pipeline;

pub use client::{run_audit, AuditError, AuditReport, ModelReply, UsageMetadata};
pub use decode::{decode_corrections, CorrectionReport, DecodeError, ResolvedCorrection};
pub use encode::{encode_batch, BatchIndex, EncodingStrategy, IndexSpace, TokenRef};
pub use pipeline::{
    capture_to_csv, correction_record, decode_session_response, discover_capture_files,
    load_session, process_all_sessions, process_session, write_prompt_output, CorrectionDetail,
    CorrectionRecord, PipelineError, PipelineStats, SessionAudit,
};
pub use prompt::{build_audit_prompt, build_review_prompt};
pub use snapshot::{ReadingToken, Snapshot, SnapshotStore};

/// Separator inserted between snapshot texts when computing global offsets.
pub const BATCH_SEPARATOR: char = '\n';

/// How many characters of a raw model response to keep in parse-failure messages.
pub const RESPONSE_PREVIEW_CHARS: usize = 120;

/// Rough character-per-token ratio for prompt cost estimates.
pub const APPROX_CHARS_PER_TOKEN: usize = 4;

/// Encoding strategy used by the production deployment.
pub const DEFAULT_STRATEGY: EncodingStrategy = EncodingStrategy::GlobalOffsetCsv;
