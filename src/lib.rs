//! Sona: bridge between a smart speaker's voice assistant and a streaming LLM.
//!
//! The bridge watches the speaker's conversation log, forwards queries to a
//! chat-completion endpoint, and plays the streamed reply back through the
//! device in sentence-sized fragments:
//! Conversation log → command dispatch → chat stream → sentence buffer → device TTS
//!
//! # Architecture
//!
//! One turn runs as a small pipeline of independent pieces:
//! - **Query polling**: reads the device conversation log via the vendor cloud API
//! - **Command dispatch**: stop and mode-toggle phrases short-circuit before the LLM
//! - **Streaming**: a producer task feeds chat deltas into a shared sentence buffer
//! - **Playback**: fragments are spoken at punctuation boundaries while the stream
//!   is still running, with barge-in on any newer query

pub mod app;
pub mod chat;
pub mod command;
pub mod config;
pub mod error;
pub mod segment;
pub mod speaker;
pub mod turn;

pub use app::App;
pub use chat::{ChatClient, CompletionStream};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use segment::{BoundaryPolicy, Extraction, SentenceBuffer};
pub use speaker::{CloudSpeaker, QueryRecord, QuerySource, SpeakerControl};
pub use turn::{TurnOutcome, TurnRunner};
