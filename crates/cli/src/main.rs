//! CLI for auditing captured furigana sessions offline.
//!
//! Processes capture CSV files exported by the extension and writes one
//! prompt record per session, ready to send to the language model. Given a
//! directory of stored model responses it also decodes them back into
//! per-token correction records.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::Parser;

use furigana_auditor_core::{
    correction_record, decode_session_response, process_all_sessions, write_prompt_output,
    EncodingStrategy, SessionAudit,
};

/// Build audit prompts from captured furigana sessions.
#[derive(Parser, Debug)]
#[command(name = "furigana-audit")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root directory containing capture CSV files
    #[arg(long)]
    csv_root: PathBuf,

    /// Output directory for prompt and correction files
    #[arg(long)]
    output_dir: PathBuf,

    /// Encoding strategy for prompt payloads
    #[arg(long, default_value = "global-offset-csv")]
    strategy: EncodingStrategy,

    /// Directory of stored model responses, one `<session stem>.txt` per session
    #[arg(long)]
    responses_root: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Processing capture files from {:?}...", args.csv_root);
    let audits = process_all_sessions(&args.csv_root, args.strategy)?;
    println!("Processed {} sessions", audits.len());

    let stats = write_prompt_output(&audits, args.strategy, &args.output_dir)?;

    let mut decoded_sessions = 0usize;
    let mut applied_corrections = 0usize;
    let mut rejected_indices = 0usize;

    if let Some(responses_root) = &args.responses_root {
        let corrections_path = args.output_dir.join("corrections.jsonl");
        let mut out = BufWriter::new(File::create(&corrections_path)?);

        for audit in audits.iter().filter(|a| a.is_auditable()) {
            let response_path = match response_path_for(audit, responses_root) {
                Some(path) => path,
                None => continue,
            };
            let response = std::fs::read_to_string(&response_path)?;

            match decode_session_response(audit, &response, args.strategy) {
                Ok(report) => {
                    decoded_sessions += 1;
                    applied_corrections += report.corrections.len();
                    rejected_indices += report.out_of_range.len();

                    let record = correction_record(audit, &report);
                    writeln!(out, "{}", serde_json::to_string(&record)?)?;
                }
                Err(e) => {
                    eprintln!("Error decoding response for {}: {}", audit.source_path, e);
                }
            }
        }
        out.flush()?;
    }

    let metadata_path = args.output_dir.join("metadata.json");
    let metadata = serde_json::json!({
        "config": {
            "csv_root": args.csv_root.to_string_lossy(),
            "output_dir": args.output_dir.to_string_lossy(),
            "strategy": args.strategy.name(),
            "responses_root": args.responses_root.as_ref().map(|p| p.to_string_lossy()),
        },
        "counts": {
            "total_sessions": stats.total_sessions,
            "audited_sessions": stats.audited_sessions,
            "skipped_sessions": stats.skipped_sessions,
            "decoded_sessions": decoded_sessions,
        },
        "stats": {
            "total_snapshots": stats.total_snapshots,
            "total_tokens": stats.total_tokens,
            "applied_corrections": applied_corrections,
            "rejected_indices": rejected_indices,
        },
        "files": {
            "prompts_path": args.output_dir.join("prompts.jsonl").to_string_lossy(),
        },
    });
    std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;

    println!("\n[summary]");
    println!("  Total sessions processed: {}", stats.total_sessions);
    println!("  Auditable sessions: {}", stats.audited_sessions);
    println!("  Skipped (nothing to audit): {}", stats.skipped_sessions);
    println!("  Total snapshots: {}", stats.total_snapshots);
    println!("  Total tokens: {}", stats.total_tokens);
    if args.responses_root.is_some() {
        println!("  Decoded responses: {}", decoded_sessions);
        println!("  Applied corrections: {}", applied_corrections);
        println!("  Rejected (out-of-range) indices: {}", rejected_indices);
    }
    println!("  Output: {:?}/prompts.jsonl", args.output_dir);
    println!("  Metadata: {:?}", metadata_path);

    Ok(())
}

/// Locate the stored response for a session: `<responses_root>/<stem>.txt`.
fn response_path_for(audit: &SessionAudit, responses_root: &Path) -> Option<PathBuf> {
    let stem = Path::new(&audit.source_path).file_stem()?;
    let path = responses_root.join(stem).with_extension("txt");
    path.exists().then_some(path)
}
