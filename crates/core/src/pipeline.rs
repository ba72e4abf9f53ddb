//! Offline pipeline: turn captured sessions into audit prompts and decode
//! stored model responses.
//!
//! A capture file is one page-view session exported by the extension as CSV.
//! Rows come in two kinds: a `node` row carrying a text node's full content,
//! followed by the `token` rows annotated on it. The pipeline rebuilds each
//! session through the snapshot store (so the store's filtering rules apply),
//! encodes it, and writes one prompt record per auditable session.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::decode::{decode_corrections, CorrectionReport, DecodeError};
use crate::encode::{encode_batch, BatchIndex, EncodingStrategy};
use crate::prompt::build_audit_prompt;
use crate::snapshot::{ReadingToken, Snapshot, SnapshotStore};

/// A row of a capture CSV file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CaptureRow {
    sequence: u64,
    #[serde(rename = "Type")]
    row_type: String,
    /// Node rows: the full text-node content. Token rows: the kanji surface.
    text: String,
    #[serde(default)]
    reading: Option<String>,
    #[serde(default)]
    start: Option<u64>,
    #[serde(default)]
    end: Option<u64>,
    #[serde(default)]
    filtered: Option<bool>,
}

/// Pipeline error types
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("capture io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture parse error: {0}")]
    Csv(#[from] csv::Error),
    #[error("token row missing {0} column")]
    MissingColumn(&'static str),
    #[error("capture export is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("output serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no capture files found under {0:?}")]
    NoSessions(PathBuf),
}

/// One processed session, ready to send or to match against a response.
#[derive(Debug, Clone)]
pub struct SessionAudit {
    pub source_path: String,
    /// The session's snapshots, as the store returned them. Kept so a
    /// response can be decoded against the same offset table the prompt was
    /// built from.
    pub snapshots: Vec<Snapshot>,
    /// Encoded payload; empty when the session has nothing to audit.
    pub encoded: String,
    pub prompt: String,
}

impl SessionAudit {
    pub fn is_auditable(&self) -> bool {
        !self.encoded.is_empty()
    }
}

/// Counters for a pipeline run.
#[derive(Debug, Serialize)]
pub struct PipelineStats {
    pub total_sessions: usize,
    pub audited_sessions: usize,
    pub skipped_sessions: usize,
    pub total_snapshots: usize,
    pub total_tokens: usize,
}

/// One prompt record written to `prompts.jsonl`.
#[derive(Debug, Serialize)]
struct PromptRecord<'a> {
    source: &'a str,
    strategy: &'static str,
    encoded: &'a str,
    prompt: &'a str,
}

/// Serializable correction output for one session.
#[derive(Debug, Serialize)]
pub struct CorrectionRecord {
    pub source: String,
    pub corrections: Vec<CorrectionDetail>,
    pub out_of_range: Vec<usize>,
}

/// A resolved correction joined with the token text it lands on.
#[derive(Debug, Serialize)]
pub struct CorrectionDetail {
    pub snapshot: usize,
    pub token: usize,
    pub original: String,
    pub reading: String,
    pub replacement: Option<String>,
}

/// Export a snapshot batch as capture CSV, the inverse of [`load_session`].
pub fn capture_to_csv(snapshots: &[Snapshot]) -> Result<String, PipelineError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut sequence = 0u64;

    for snapshot in snapshots {
        sequence += 1;
        writer.serialize(CaptureRow {
            sequence,
            row_type: "node".to_string(),
            text: snapshot.text.clone(),
            reading: None,
            start: None,
            end: None,
            filtered: None,
        })?;

        for token in &snapshot.tokens {
            sequence += 1;
            writer.serialize(CaptureRow {
                sequence,
                row_type: "token".to_string(),
                text: token.original.clone(),
                reading: Some(token.reading.clone()),
                start: Some(token.start as u64),
                end: Some(token.end as u64),
                filtered: Some(token.is_filtered),
            })?;
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(String::from_utf8(bytes)?)
}

/// Rebuild a session's snapshot store from a capture CSV file.
///
/// Rows feed through [`SnapshotStore::add_snapshot`], so nodes that captured
/// no tokens are dropped here exactly as they would be in the live store.
pub fn load_session(path: &Path) -> Result<SnapshotStore, PipelineError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut store = SnapshotStore::new();
    let mut text: Option<String> = None;
    let mut tokens: Vec<ReadingToken> = Vec::new();

    for result in reader.deserialize() {
        let row: CaptureRow = result?;
        match row.row_type.as_str() {
            "node" => {
                if let Some(current) = text.take() {
                    store.add_snapshot(current, std::mem::take(&mut tokens));
                }
                text = Some(row.text);
            }
            "token" => {
                if text.is_none() {
                    eprintln!(
                        "[furigana-audit] token row before any node row in {:?}, skipping",
                        path
                    );
                    continue;
                }
                tokens.push(ReadingToken {
                    original: row.text,
                    reading: row.reading.ok_or(PipelineError::MissingColumn("Reading"))?,
                    start: row.start.ok_or(PipelineError::MissingColumn("Start"))? as usize,
                    end: row.end.ok_or(PipelineError::MissingColumn("End"))? as usize,
                    is_filtered: row.filtered.unwrap_or(false),
                });
            }
            other => {
                eprintln!(
                    "[furigana-audit] unknown row type '{}' in {:?}",
                    other, path
                );
            }
        }
    }

    if let Some(current) = text {
        store.add_snapshot(current, tokens);
    }

    Ok(store)
}

/// Discover all capture CSV files under a directory, sorted.
pub fn discover_capture_files(root: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "csv"))
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();
    paths
}

/// Load and encode a single capture session.
pub fn process_session(
    path: &Path,
    strategy: EncodingStrategy,
) -> Result<SessionAudit, PipelineError> {
    let store = load_session(path)?;
    let snapshots = store.get_snapshots();

    let encoded = encode_batch(&snapshots, strategy);
    let prompt = if encoded.is_empty() {
        String::new()
    } else {
        build_audit_prompt(&encoded, strategy)
    };

    Ok(SessionAudit {
        source_path: path.to_string_lossy().to_string(),
        snapshots,
        encoded,
        prompt,
    })
}

/// Process all capture sessions under a directory in parallel.
///
/// Sessions are independent; per-session failures are logged and skipped so
/// one corrupt capture cannot sink a batch run.
pub fn process_all_sessions(
    root: &Path,
    strategy: EncodingStrategy,
) -> Result<Vec<SessionAudit>, PipelineError> {
    let capture_files = discover_capture_files(root);

    if capture_files.is_empty() {
        return Err(PipelineError::NoSessions(root.to_path_buf()));
    }

    let total_files = capture_files.len();
    let processed_count = AtomicUsize::new(0);
    let error_count = AtomicUsize::new(0);

    let results: Vec<SessionAudit> = capture_files
        .into_par_iter()
        .filter_map(|path| {
            let result = process_session(&path, strategy);
            let count = processed_count.fetch_add(1, Ordering::Relaxed) + 1;

            match result {
                Ok(audit) => {
                    if count % 100 == 0 || count == total_files {
                        eprintln!(
                            "[furigana-audit] processed {}/{} sessions...",
                            count, total_files
                        );
                    }
                    Some(audit)
                }
                Err(e) => {
                    error_count.fetch_add(1, Ordering::Relaxed);
                    eprintln!("[furigana-audit] error processing {:?}: {}", path, e);
                    None
                }
            }
        })
        .collect();

    let errors = error_count.load(Ordering::Relaxed);
    if errors > 0 {
        eprintln!("[furigana-audit] {} sessions failed to process", errors);
    }

    Ok(results)
}

/// Write one prompt record per auditable session to `prompts.jsonl`.
pub fn write_prompt_output(
    audits: &[SessionAudit],
    strategy: EncodingStrategy,
    output_dir: &Path,
) -> Result<PipelineStats, PipelineError> {
    std::fs::create_dir_all(output_dir)?;

    let prompts_path = output_dir.join("prompts.jsonl");
    let mut out = BufWriter::new(File::create(&prompts_path)?);

    let mut stats = PipelineStats {
        total_sessions: audits.len(),
        audited_sessions: 0,
        skipped_sessions: 0,
        total_snapshots: 0,
        total_tokens: 0,
    };

    for audit in audits {
        stats.total_snapshots += audit.snapshots.len();
        stats.total_tokens += audit.snapshots.iter().map(|s| s.tokens.len()).sum::<usize>();

        if !audit.is_auditable() {
            stats.skipped_sessions += 1;
            continue;
        }

        let record = PromptRecord {
            source: &audit.source_path,
            strategy: strategy.name(),
            encoded: &audit.encoded,
            prompt: &audit.prompt,
        };
        writeln!(out, "{}", serde_json::to_string(&record)?)?;
        stats.audited_sessions += 1;
    }

    out.flush()?;
    Ok(stats)
}

/// Decode a stored model response against the session's own offset table.
pub fn decode_session_response(
    audit: &SessionAudit,
    response: &str,
    strategy: EncodingStrategy,
) -> Result<CorrectionReport, DecodeError> {
    let index = BatchIndex::new(&audit.snapshots);
    decode_corrections(response, &index, strategy.index_space())
}

/// Flatten a decoded report into its serializable output record.
pub fn correction_record(audit: &SessionAudit, report: &CorrectionReport) -> CorrectionRecord {
    let corrections = report
        .corrections
        .iter()
        .map(|c| {
            let token = &audit.snapshots[c.snapshot].tokens[c.token];
            CorrectionDetail {
                snapshot: c.snapshot,
                token: c.token,
                original: token.original.clone(),
                reading: token.reading.clone(),
                replacement: c.replacement.clone(),
            }
        })
        .collect();

    CorrectionRecord {
        source: audit.source_path.clone(),
        corrections,
        out_of_range: report.out_of_range.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_store() -> SnapshotStore {
        let mut store = SnapshotStore::new();
        store.add_snapshot(
            "振り仮名",
            vec![
                ReadingToken::new("振", "ふ", 0, 1),
                ReadingToken::new("仮名", "かな", 2, 4),
            ],
        );
        store.add_snapshot("黒猫", vec![ReadingToken::new("黒猫", "くろねこ", 0, 2)]);
        store
    }

    #[test]
    fn test_capture_csv_round_trip() {
        let store = sample_store();
        let csv_text = capture_to_csv(&store.get_snapshots()).unwrap();

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("session.csv");
        std::fs::write(&path, csv_text).unwrap();

        let reloaded = load_session(&path).unwrap();
        assert_eq!(reloaded.get_snapshots(), store.get_snapshots());
    }

    #[test]
    fn test_load_session_drops_tokenless_nodes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("session.csv");
        std::fs::write(
            &path,
            "Sequence,Type,Text,Reading,Start,End,Filtered\n\
             1,node,ひらがなだけ,,,,\n\
             2,node,黒猫,,,,\n\
             3,token,黒,くろ,0,1,false\n",
        )
        .unwrap();

        let store = load_session(&path).unwrap();
        let snapshots = store.get_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].text, "黒猫");
    }

    #[test]
    fn test_load_session_missing_column() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("session.csv");
        std::fs::write(
            &path,
            "Sequence,Type,Text,Reading,Start,End,Filtered\n\
             1,node,黒猫,,,,\n\
             2,token,黒,くろ,,1,\n",
        )
        .unwrap();

        let err = load_session(&path).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn("Start")));
    }

    #[test]
    fn test_discover_capture_files() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("subdir")).unwrap();
        std::fs::write(temp.path().join("b.csv"), "x\n").unwrap();
        std::fs::write(temp.path().join("subdir/a.csv"), "x\n").unwrap();
        std::fs::write(temp.path().join("notes.txt"), "x\n").unwrap();

        let files = discover_capture_files(temp.path());
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("b.csv"));
    }

    #[test]
    fn test_process_session_and_output() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("session.csv");
        std::fs::write(&path, capture_to_csv(&sample_store().get_snapshots()).unwrap()).unwrap();

        let audit = process_session(&path, EncodingStrategy::GlobalOffsetCsv).unwrap();
        assert!(audit.is_auditable());
        assert!(audit.encoded.contains("5,黒猫,くろねこ"));
        assert!(audit.prompt.contains(&audit.encoded));

        let out_dir = temp.path().join("out");
        let stats =
            write_prompt_output(&[audit], EncodingStrategy::GlobalOffsetCsv, &out_dir).unwrap();
        assert_eq!(stats.audited_sessions, 1);
        assert_eq!(stats.total_tokens, 3);

        let written = std::fs::read_to_string(out_dir.join("prompts.jsonl")).unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.contains("global-offset-csv"));
    }

    #[test]
    fn test_decode_session_response() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("session.csv");
        std::fs::write(&path, capture_to_csv(&sample_store().get_snapshots()).unwrap()).unwrap();

        let audit = process_session(&path, EncodingStrategy::GlobalOffsetCsv).unwrap();
        // "振り仮名" is 4 chars; the second snapshot's token sits at 4 + 1.
        let report = decode_session_response(&audit, "[5]", EncodingStrategy::GlobalOffsetCsv)
            .unwrap();

        let record = correction_record(&audit, &report);
        assert_eq!(record.corrections.len(), 1);
        assert_eq!(record.corrections[0].original, "黒猫");
        assert_eq!(record.corrections[0].reading, "くろねこ");
    }

    #[test]
    fn test_process_all_sessions_skips_corrupt_file() {
        let temp = TempDir::new().unwrap();
        let good = temp.path().join("good.csv");
        std::fs::write(&good, capture_to_csv(&sample_store().get_snapshots()).unwrap()).unwrap();
        let bad = temp.path().join("bad.csv");
        std::fs::write(
            &bad,
            "Sequence,Type,Text,Reading,Start,End,Filtered\n\
             1,node,黒猫,,,,\n\
             2,token,黒,くろ,,1,\n",
        )
        .unwrap();

        let audits = process_all_sessions(temp.path(), EncodingStrategy::PairList).unwrap();
        assert_eq!(audits.len(), 1);
        assert!(audits[0].source_path.ends_with("good.csv"));
    }

    #[test]
    fn test_process_all_sessions_empty_root() {
        let temp = TempDir::new().unwrap();
        let err = process_all_sessions(temp.path(), EncodingStrategy::PairList).unwrap_err();
        assert!(matches!(err, PipelineError::NoSessions(_)));
    }
}
