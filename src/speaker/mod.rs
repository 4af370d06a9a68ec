//! Speaker-facing interfaces and the vendor cloud implementation.
//!
//! The turn runner only sees the two traits here; [`CloudSpeaker`] implements
//! both against the vendor cloud API, and tests substitute scripted fakes.

pub mod auth;
pub mod cloud;

pub use cloud::{CloudSpeaker, DeviceInfo};

use crate::error::Result;
use async_trait::async_trait;

/// One voice-assistant query/answer record from the device conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    /// Record time in ms since epoch; newer records have larger values.
    pub timestamp: i64,
    /// What the user said.
    pub query: String,
    /// The device assistant's own answer, when it gave one.
    pub answer: Option<String>,
}

/// Read side of the device conversation log.
#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Fetch the most recent query record, if any.
    ///
    /// Repeatable with no side effects beyond the remote read; the main loop
    /// and the turn runner both poll this.
    async fn latest_query(&self) -> Result<Option<QueryRecord>>;
}

/// Control side of the speaker.
#[async_trait]
pub trait SpeakerControl: Send + Sync {
    /// Whether the device is currently playing audio.
    async fn is_playing(&self) -> Result<bool>;

    /// Speak text on the device.
    ///
    /// Vendor hardware occasionally rejects TTS commands transiently, so
    /// callers treat failures as best-effort and drop the fragment.
    async fn speak(&self, text: &str) -> Result<()>;

    /// Pause playback.
    async fn pause(&self) -> Result<()>;
}
