//! Shared sentence buffer between the stream producer and the playback loop.
//!
//! The producer (chat stream task) appends text deltas; the consumer (playback
//! loop) extracts speakable fragments at punctuation boundaries. Both sides use
//! non-blocking lock attempts so the network-bound producer is never parked
//! behind the slower audio-bound consumer: a delta that arrives while the lock
//! is contended is held in the writer's private `pending` string and merged on
//! the next successful acquisition. Only [`SentenceBuffer::clear`] (the
//! interruption path) blocks.
//!
//! A cancelled producer abandons its `pending` text by dropping the writer;
//! the buffer itself lives for one turn and is discarded with it.

use crate::config::SegmentConfig;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

/// Result of a non-blocking fragment extraction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// A complete fragment ending in a boundary character.
    Fragment(String),
    /// Lock acquired but no boundary character is buffered yet.
    NoBoundary,
    /// Lock held by the producer; back off and retry.
    Contended,
}

/// Punctuation sets controlling where fragments may end.
///
/// The early set (which includes soft separators like commas) applies while
/// fewer than `limit` boundary characters have been spoken, so the first
/// fragments are short and playback starts quickly. After that only strong
/// terminators end a fragment, which reads more naturally.
#[derive(Debug, Clone)]
pub struct BoundaryPolicy {
    early: Vec<char>,
    strong: Vec<char>,
    limit: usize,
}

impl BoundaryPolicy {
    /// Build a policy from boundary character sets and the early-phase limit.
    pub fn new(early: &str, strong: &str, limit: usize) -> Self {
        Self {
            early: early.chars().collect(),
            strong: strong.chars().collect(),
            limit,
        }
    }

    /// Build a policy from the segmentation config section.
    pub fn from_config(config: &SegmentConfig) -> Self {
        Self::new(
            &config.early_boundaries,
            &config.strong_boundaries,
            config.early_fragment_limit,
        )
    }

    /// The boundary set active after `hits` boundary characters were spoken.
    pub fn active_set(&self, hits: usize) -> &[char] {
        if self.in_early_phase(hits) {
            &self.early
        } else {
            &self.strong
        }
    }

    /// Whether the early (soft-separator) set is still active.
    pub fn in_early_phase(&self, hits: usize) -> bool {
        hits < self.limit
    }

    /// Count the boundary characters contained in a spoken fragment.
    pub fn count_hits(&self, fragment: &str) -> usize {
        fragment
            .chars()
            .filter(|c| self.early.contains(c) || self.strong.contains(c))
            .count()
    }
}

/// Text shared between the stream producer and the playback loop.
///
/// Holds the `committed` text ready for extraction. The producer half is
/// [`DeltaWriter`], which owns the contention-parking `pending` string.
#[derive(Debug, Default)]
pub struct SentenceBuffer {
    committed: Mutex<String>,
}

impl SentenceBuffer {
    /// Create an empty buffer for one turn.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the producer half writing into this buffer.
    pub fn writer(self: &Arc<Self>) -> DeltaWriter {
        DeltaWriter {
            shared: Arc::clone(self),
            pending: String::new(),
        }
    }

    /// Try to extract the longest prefix ending in a boundary character.
    ///
    /// Non-blocking: returns [`Extraction::Contended`] when the producer holds
    /// the lock (back off briefly and retry). On success the fragment is
    /// removed from the buffer, so no two extractions ever overlap.
    pub fn try_extract(&self, boundaries: &[char]) -> Extraction {
        let mut committed = match self.committed.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Extraction::Contended,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        match last_boundary(&committed, boundaries) {
            Some(pos) => {
                let rest = committed.split_off(pos + 1);
                let fragment = std::mem::replace(&mut *committed, rest);
                Extraction::Fragment(fragment)
            }
            None => Extraction::NoBoundary,
        }
    }

    /// Take whatever is buffered, boundary or not.
    ///
    /// The final flush once the producer has finished: the tail of a reply
    /// often ends without punctuation and must still be spoken. Returns
    /// `None` when nothing is buffered.
    pub fn take_remainder(&self) -> Option<String> {
        let mut committed = self.lock_committed();
        if committed.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *committed))
        }
    }

    /// Loop-termination predicate: nothing buffered and the producer has
    /// finished, so no further fragment can ever arrive.
    pub fn is_drained(&self, producer_finished: bool) -> bool {
        producer_finished && self.lock_committed().is_empty()
    }

    /// Drop all buffered text. Interruption path: blocking acquire, since
    /// correctness on barge-in outweighs producer latency. Idempotent.
    pub fn clear(&self) {
        self.lock_committed().clear();
    }

    fn lock_committed(&self) -> MutexGuard<'_, String> {
        self.committed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer half of a [`SentenceBuffer`].
///
/// Owns the `pending` text that arrived while the consumer held the lock.
/// Dropping the writer abandons any pending text, which is exactly what a
/// cancelled producer should do.
#[derive(Debug)]
pub struct DeltaWriter {
    shared: Arc<SentenceBuffer>,
    pending: String,
}

impl DeltaWriter {
    /// Append one stream delta without ever blocking.
    ///
    /// On a successful try-lock any parked `pending` text is flushed first,
    /// then the delta, preserving stream order exactly. On contention the
    /// delta is parked. No character is lost or duplicated either way.
    pub fn append(&mut self, delta: &str) {
        let mut committed = match self.shared.committed.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                self.pending.push_str(delta);
                return;
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        committed.push_str(&self.pending);
        self.pending.clear();
        committed.push_str(delta);
    }

    /// Text parked during lock contention, not yet visible to the consumer.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Flush any parked text with a blocking acquire and consume the writer.
    ///
    /// Called once at normal stream end, where the tail must become visible
    /// even if the last append hit contention. A cancelled producer skips
    /// this and drops the writer instead.
    pub fn finish(self) {
        if self.pending.is_empty() {
            return;
        }
        self.shared.lock_committed().push_str(&self.pending);
    }
}

/// Byte index of the last byte of the right-most boundary character.
///
/// Callers split with `text[..=pos]` / `text[pos + 1..]`, so the last byte of
/// the (possibly multi-byte) character is returned to keep both slices on
/// valid UTF-8 char boundaries.
fn last_boundary(text: &str, boundaries: &[char]) -> Option<usize> {
    let mut last = None;
    for (i, c) in text.char_indices() {
        if boundaries.contains(&c) {
            last = Some(i + c.len_utf8() - 1);
        }
    }
    last
}
