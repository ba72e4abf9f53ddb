//! Prompt templates wrapping an encoded batch with model instructions.
//!
//! The output-format paragraph is the contract half of the round trip: it
//! must advertise exactly the shapes the decoder accepts, in the index space
//! the chosen encoding uses.

use crate::encode::{EncodingStrategy, IndexSpace};
use crate::snapshot::Snapshot;

/// Wrap an encoded batch with audit instructions.
///
/// Pure string formatting. Callers short-circuit before this on an empty
/// batch; an empty `encoded` here means the caller skipped that check.
pub fn build_audit_prompt(encoded: &str, strategy: EncodingStrategy) -> String {
    let input_format = match strategy {
        EncodingStrategy::InlineReading => {
            "Each line is one text with its readings inserted in parentheses \
             directly after the kanji they annotate, like 振(ふ)り仮名(かな)."
        }
        EncodingStrategy::NumberedInline => {
            "Each line is one numbered text with its readings inserted in \
             parentheses directly after the kanji they annotate, like \
             1. 振(ふ)り仮名(かな)."
        }
        EncodingStrategy::SnapshotCsv => {
            "Texts appear as blocks separated by a blank line. The first line \
             of a block is the original text; every following line is \
             start,kanji,reading where start is the character position of the \
             kanji within that text."
        }
        EncodingStrategy::GlobalOffsetCsv => {
            "The original texts come first, one per line. After them, every \
             line is offset,kanji,reading where offset is the character \
             position of the kanji counted over all texts joined with single \
             newlines."
        }
        EncodingStrategy::PairList => {
            "Each line is one text reduced to its annotated tokens, written \
             as kanji,reading; pairs in reading order."
        }
    };

    let output_format = match strategy.index_space() {
        IndexSpace::TokenOrdinal => {
            "Reply with a JSON array of the zero-based positions of the wrong \
             tokens, counting every annotated token in order across the whole \
             input (example: [0,4]). To supply corrected readings instead, \
             reply with a JSON object mapping each position to the corrected \
             kana (example: {\"0\":\"ふ\"}). Reply with [] when every reading \
             is correct. Output the JSON only."
        }
        IndexSpace::GlobalOffset => {
            "Reply with a JSON array of the offsets of the wrong tokens, \
             copied exactly from the first column of the token lines \
             (example: [3]). To supply corrected readings instead, reply with \
             a JSON object mapping each offset to the corrected kana \
             (example: {\"3\":\"しろ\"}). Reply with [] when every reading is \
             correct. Output the JSON only."
        }
    };

    format!(
        r#"## Task
Audit the furigana readings below. Every kanji token carries the reading currently shown to the reader. Find each token whose reading is wrong for its context.

## Input format
{input_format}

## Input data
{encoded}

## Output format
{output_format}"#
    )
}

/// Build the human-review listing of a batch's readings.
///
/// Verbose counterpart to the audit prompt, used to eyeball a page's
/// annotations or to ask for free-form commentary rather than a machine
/// decodable correction set. Follows the encoder's filtering rules: tokenless
/// snapshots are skipped and an all-empty batch yields `""`.
pub fn build_review_prompt(snapshots: &[Snapshot]) -> String {
    let contributing: Vec<_> = snapshots.iter().filter(|s| !s.tokens.is_empty()).collect();
    if contributing.is_empty() {
        return String::new();
    }

    let mut lines = vec![
        "You are a Japanese reading (furigana) auditor. The following are sentences and their current readings.".to_string(),
        "For each token, check whether the reading is natural in context. If something is wrong or ambiguous, explain briefly in Japanese.".to_string(),
        String::new(),
    ];

    for (i, snapshot) in contributing.iter().enumerate() {
        lines.push(format!("Sentence {}:", i + 1));
        lines.push(format!("原文: {}", snapshot.text));
        lines.push("読み:".to_string());
        for token in &snapshot.tokens {
            lines.push(format!("- {} => {}", token.original, token.reading));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}
