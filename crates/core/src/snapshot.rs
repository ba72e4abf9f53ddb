//! Snapshot store buffering annotated text nodes for a page view.

use serde::{Deserialize, Serialize};

/// One reading annotation: a kanji substring and the kana assigned to it.
///
/// `start`/`end` are half-open offsets into the owning text, counted in
/// characters (not bytes). The producing pipeline guarantees that the span
/// matches `original`; the encoders do not re-check it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingToken {
    pub original: String,
    pub reading: String,
    pub start: usize,
    pub end: usize,
    /// Advisory flag from the tokenizer; encoders and decoders ignore it.
    #[serde(default)]
    pub is_filtered: bool,
}

impl ReadingToken {
    pub fn new(
        original: impl Into<String>,
        reading: impl Into<String>,
        start: usize,
        end: usize,
    ) -> Self {
        Self {
            original: original.into(),
            reading: reading.into(),
            start,
            end,
            is_filtered: false,
        }
    }
}

/// One captured text node: its full content and the tokens annotated on it.
///
/// Token order is the document order of discovery and is not guaranteed to be
/// sorted by `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub text: String,
    pub tokens: Vec<ReadingToken>,
}

/// In-memory buffer of all snapshots captured for the current page.
///
/// One instance per content-script session (per tab); never persisted. The
/// owner clears it when the page context resets so a navigation cannot mix
/// stale annotations into a new page's batch.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: Vec<Snapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save one snapshot. Empty text or an empty token list is silently
    /// dropped; such a node carries nothing worth auditing.
    pub fn add_snapshot(&mut self, text: impl Into<String>, tokens: Vec<ReadingToken>) {
        let text = text.into();
        if text.is_empty() || tokens.is_empty() {
            return;
        }
        self.snapshots.push(Snapshot { text, tokens });
    }

    /// Drop all stored snapshots for the current page.
    pub fn clear_snapshots(&mut self) {
        self.snapshots.clear();
    }

    /// Get an independent copy of all snapshots, in capture order.
    ///
    /// Mutating the returned vector never affects the store, so an audit
    /// request can hold it across the model call while the page keeps
    /// producing new snapshots.
    pub fn get_snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(original: &str, reading: &str, start: usize, end: usize) -> ReadingToken {
        ReadingToken::new(original, reading, start, end)
    }

    #[test]
    fn test_add_snapshot_rejects_empty_text() {
        let mut store = SnapshotStore::new();
        store.add_snapshot("", vec![token("振", "ふ", 0, 1)]);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_add_snapshot_rejects_empty_tokens() {
        let mut store = SnapshotStore::new();
        store.add_snapshot("text", vec![]);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_add_and_clear() {
        let mut store = SnapshotStore::new();
        store.add_snapshot("振り仮名", vec![token("振", "ふ", 0, 1)]);
        store.add_snapshot("黒猫", vec![token("黒猫", "くろねこ", 0, 2)]);
        assert_eq!(store.len(), 2);

        store.clear_snapshots();
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_snapshots_returns_copy() {
        let mut store = SnapshotStore::new();
        store.add_snapshot("黒猫", vec![token("黒", "くろ", 0, 1)]);

        let mut copy = store.get_snapshots();
        copy.clear();
        assert_eq!(store.len(), 1);

        let mut copy = store.get_snapshots();
        copy[0].tokens.push(token("猫", "ねこ", 1, 2));
        assert_eq!(store.get_snapshots()[0].tokens.len(), 1);
    }

    #[test]
    fn test_capture_order_preserved() {
        let mut store = SnapshotStore::new();
        store.add_snapshot("白犬", vec![token("白", "しろ", 0, 1)]);
        store.add_snapshot("黒猫", vec![token("黒", "くろ", 0, 1)]);

        let snapshots = store.get_snapshots();
        assert_eq!(snapshots[0].text, "白犬");
        assert_eq!(snapshots[1].text, "黒猫");
    }
}
