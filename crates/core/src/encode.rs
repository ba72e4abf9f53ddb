//! Prompt encoders: serialize a snapshot batch into a compact audit payload.
//!
//! Several wire formats exist with different cost/robustness tradeoffs; all
//! honor the same contract. Snapshots without tokens are excluded before any
//! numbering or offset arithmetic, a batch with nothing to audit encodes to
//! the empty string, and the output is deterministic for a given batch.

use std::fmt;
use std::str::FromStr;

use crate::snapshot::Snapshot;

/// Wire format for the encoded batch.
///
/// Exactly one strategy is the documented contract of a deployment
/// ([`crate::DEFAULT_STRATEGY`]); the others remain selectable so the prompt
/// payload can be tuned without touching encoder internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingStrategy {
    /// Text reconstructed with `(reading)` after each annotated span,
    /// one snapshot per line: `振(ふ)り仮名(かな)`.
    InlineReading,
    /// [`InlineReading`](Self::InlineReading) with a `N. ` line prefix for
    /// human review across many lines.
    NumberedInline,
    /// Per-snapshot block: the text on the first line, then one
    /// `start,original,reading` line per token. Blocks separated by a blank
    /// line; `start` is local to the block.
    SnapshotCsv,
    /// All texts joined with [`crate::BATCH_SEPARATOR`], then one
    /// `offset,original,reading` line per token where `offset` is cumulative
    /// over the whole joined text. Unambiguous across snapshot boundaries.
    GlobalOffsetCsv,
    /// One line per snapshot of `original,reading;` pairs. Smallest payload;
    /// corrections reference flattened token order.
    PairList,
}

impl EncodingStrategy {
    pub fn name(self) -> &'static str {
        match self {
            Self::InlineReading => "inline",
            Self::NumberedInline => "numbered",
            Self::SnapshotCsv => "snapshot-csv",
            Self::GlobalOffsetCsv => "global-offset-csv",
            Self::PairList => "pair-list",
        }
    }

    /// The numeric space correction responses use for this format.
    ///
    /// Carried on the strategy so the prompt instructions and the decoder can
    /// never disagree about what an index means.
    pub fn index_space(self) -> IndexSpace {
        match self {
            Self::GlobalOffsetCsv => IndexSpace::GlobalOffset,
            _ => IndexSpace::TokenOrdinal,
        }
    }
}

impl fmt::Display for EncodingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EncodingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(Self::InlineReading),
            "numbered" => Ok(Self::NumberedInline),
            "snapshot-csv" => Ok(Self::SnapshotCsv),
            "global-offset-csv" => Ok(Self::GlobalOffsetCsv),
            "pair-list" => Ok(Self::PairList),
            other => Err(format!("unknown encoding strategy '{}'", other)),
        }
    }
}

/// How a numeric index in a correction response is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSpace {
    /// Zero-based position in the flattened token list, capture order.
    TokenOrdinal,
    /// Character offset into the batch's joined texts.
    GlobalOffset,
}

/// Serialize a batch of snapshots with the given strategy.
///
/// Returns `""` when the batch is empty or no snapshot has tokens; callers
/// must then skip the model call entirely: there is nothing to audit and the
/// call is billable.
pub fn encode_batch(snapshots: &[Snapshot], strategy: EncodingStrategy) -> String {
    let filtered = contributing(snapshots);
    if filtered.is_empty() {
        return String::new();
    }

    match strategy {
        EncodingStrategy::InlineReading => filtered
            .iter()
            .map(|s| inline_reading(s))
            .collect::<Vec<_>>()
            .join("\n"),
        EncodingStrategy::NumberedInline => filtered
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}", i + 1, inline_reading(s)))
            .collect::<Vec<_>>()
            .join("\n"),
        EncodingStrategy::SnapshotCsv => filtered
            .iter()
            .map(|s| snapshot_csv(s))
            .collect::<Vec<_>>()
            .join("\n\n"),
        EncodingStrategy::GlobalOffsetCsv => global_offset_csv(snapshots, &filtered),
        EncodingStrategy::PairList => filtered
            .iter()
            .map(|s| pair_list_line(s))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Snapshots that contribute to the encoded output, in batch order.
fn contributing(snapshots: &[Snapshot]) -> Vec<&Snapshot> {
    snapshots.iter().filter(|s| !s.tokens.is_empty()).collect()
}

/// Rebuild the text with `(reading)` inserted after each token span.
///
/// Insertions run by descending `start` so earlier offsets never drift while
/// later spans are expanded. Spans are clamped to the text; a malformed token
/// is the producing pipeline's bug, not a panic.
fn inline_reading(snapshot: &Snapshot) -> String {
    let mut rendered: Vec<char> = snapshot.text.chars().collect();

    let mut order: Vec<_> = snapshot.tokens.iter().collect();
    order.sort_by(|a, b| b.start.cmp(&a.start));

    for token in order {
        let at = token.end.min(rendered.len());
        let insertion: Vec<char> = format!("({})", token.reading).chars().collect();
        rendered.splice(at..at, insertion);
    }

    rendered.into_iter().collect()
}

fn snapshot_csv(snapshot: &Snapshot) -> String {
    let mut lines = vec![snapshot.text.clone()];
    for token in &snapshot.tokens {
        lines.push(format!("{},{},{}", token.start, token.original, token.reading));
    }
    lines.join("\n")
}

fn global_offset_csv(snapshots: &[Snapshot], filtered: &[&Snapshot]) -> String {
    let index = BatchIndex::new(snapshots);
    let mut lines: Vec<String> = filtered.iter().map(|s| s.text.clone()).collect();
    for entry in index.entries() {
        let token = &snapshots[entry.snapshot].tokens[entry.token];
        lines.push(format!(
            "{},{},{}",
            entry.global_start, token.original, token.reading
        ));
    }
    lines.join("\n")
}

fn pair_list_line(snapshot: &Snapshot) -> String {
    snapshot
        .tokens
        .iter()
        .map(|t| format!("{},{};", t.original, t.reading))
        .collect()
}

/// Coordinates of one flattened token.
///
/// `snapshot` and `token` index the batch slice the [`BatchIndex`] was built
/// from, so resolution always lands on the caller's original coordinates even
/// when zero-token snapshots sit between contributing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRef {
    pub snapshot: usize,
    pub token: usize,
    /// Character offset of the token in the batch's joined texts.
    pub global_start: usize,
}

/// Offset table over a snapshot batch: the inverse of whatever numbering the
/// encoder emitted.
///
/// Built from the same slice that was encoded; tokens are flattened in
/// capture order. The cumulative offset before the i-th contributing snapshot
/// is the sum of the preceding contributing texts' lengths (in characters)
/// plus one separator per preceding text. This arithmetic must be exact; an
/// off-by-one here silently corrupts every correction after the first
/// multi-token snapshot.
#[derive(Debug, Clone, Default)]
pub struct BatchIndex {
    entries: Vec<TokenRef>,
}

impl BatchIndex {
    pub fn new(snapshots: &[Snapshot]) -> Self {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        let mut first = true;

        for (si, snapshot) in snapshots.iter().enumerate() {
            if snapshot.tokens.is_empty() {
                continue;
            }
            if !first {
                offset += 1; // one BATCH_SEPARATOR per preceding text
            }
            first = false;

            for (ti, token) in snapshot.tokens.iter().enumerate() {
                entries.push(TokenRef {
                    snapshot: si,
                    token: ti,
                    global_start: offset + token.start,
                });
            }
            offset += snapshot.text.chars().count();
        }

        Self { entries }
    }

    /// Flattened entries in capture order.
    pub fn entries(&self) -> &[TokenRef] {
        &self.entries
    }

    /// Total number of tokens the encoded batch contained.
    pub fn token_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a zero-based flattened-token position.
    pub fn resolve_ordinal(&self, ordinal: usize) -> Option<TokenRef> {
        self.entries.get(ordinal).copied()
    }

    /// Resolve a global character offset. Only an exact `global_start` match
    /// resolves; anything else is out of range rather than a guess at the
    /// nearest token.
    pub fn resolve_offset(&self, offset: usize) -> Option<TokenRef> {
        self.entries
            .iter()
            .find(|e| e.global_start == offset)
            .copied()
    }

    /// Resolve an index in the given space.
    pub fn resolve(&self, index: usize, space: IndexSpace) -> Option<TokenRef> {
        match space {
            IndexSpace::TokenOrdinal => self.resolve_ordinal(index),
            IndexSpace::GlobalOffset => self.resolve_offset(index),
        }
    }
}
