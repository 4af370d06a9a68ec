//! Main poll loop and query dispatch.
//!
//! [`App`] owns the long-lived pieces: the cloud speaker session, the chat
//! client with its history, the advanced-mode flag and the last-seen query
//! timestamp. Its loop polls the conversation log, routes each new query
//! through the command table, and runs one [`TurnRunner`] per forwarded
//! query. Poll failures are logged and the loop keeps going; only startup
//! errors are fatal.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::ChatClient;
use crate::command::{self, Dispatch};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::segment::{BoundaryPolicy, SentenceBuffer};
use crate::speaker::{CloudSpeaker, QueryRecord, QuerySource, SpeakerControl};
use crate::turn::{TurnOutcome, TurnRunner};

pub struct App {
    config: BridgeConfig,
    speaker: Arc<CloudSpeaker>,
    chat: ChatClient,
    mode_enabled: bool,
    last_seen: i64,
}

impl App {
    pub fn new(config: BridgeConfig) -> Self {
        let speaker = Arc::new(CloudSpeaker::new(
            config.speaker.clone(),
            config.timing.clone(),
        ));
        let chat = ChatClient::new(config.chat.clone());
        Self {
            config,
            speaker,
            chat,
            // Advanced dialogue is live from the start; the off phrase is
            // the way to quiet it.
            mode_enabled: true,
            last_seen: 0,
        }
    }

    /// Establish the session and poll the conversation log forever.
    pub async fn run(&mut self) -> Result<()> {
        self.speaker.connect().await?;
        self.adopt_baseline().await?;
        info!(
            "listening; {} / {} toggle the advanced dialogue mode",
            command::MODE_ON_PREFIXES[0],
            command::MODE_OFF_PREFIXES[0]
        );

        loop {
            sleep(Duration::from_millis(self.config.timing.query_poll_ms)).await;
            let record = match self.speaker.latest_query().await {
                Ok(Some(record)) if record.timestamp > self.last_seen => record,
                Ok(_) => continue,
                Err(e) => {
                    warn!("query poll failed: {e}");
                    continue;
                }
            };
            self.last_seen = record.timestamp;
            self.handle_query(record).await;
        }
    }

    /// Queries older than the newest record at startup are history, not
    /// commands; adopt the newest record's timestamp as the watermark.
    /// Without it the first poll would replay a pre-existing query, so a
    /// failed baseline poll is fatal like the rest of startup.
    async fn adopt_baseline(&mut self) -> Result<()> {
        if let Some(record) = self.speaker.latest_query().await? {
            self.last_seen = record.timestamp;
        }
        Ok(())
    }

    async fn handle_query(&mut self, record: QueryRecord) {
        let (mode, action) = command::dispatch(&record.query, self.mode_enabled);
        self.mode_enabled = mode;

        match action {
            Dispatch::StopPlayback => {
                info!("stop command: {}", record.query);
                self.stop_if_playing().await;
            }
            Dispatch::ModeSet { enabled, ack } => {
                info!(
                    "advanced mode {}",
                    if enabled { "enabled" } else { "disabled" }
                );
                if let Err(e) = self.speaker.speak(ack).await {
                    warn!("mode ack failed: {e}");
                }
            }
            Dispatch::Forward => {
                if !self.mode_enabled {
                    debug!("ignoring query, advanced mode off: {}", record.query);
                    return;
                }
                self.run_turn(record).await;
            }
        }
    }

    /// One full assistant turn for a forwarded query.
    async fn run_turn(&mut self, record: QueryRecord) {
        info!("query: {}", record.query);
        if let Some(answer) = &record.answer {
            debug!("device answered: {answer}");
        }
        // The device has started speaking its own answer by now; quiet it
        // before the streamed reply.
        self.stop_if_playing().await;

        let augmented = format!("{}，{}", record.query, self.config.chat.brevity_prompt);
        let buffer = Arc::new(SentenceBuffer::new());
        let cancel = CancellationToken::new();
        let stream = match self
            .chat
            .begin_stream(&augmented, buffer.writer(), cancel.clone())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!("chat request failed: {e}");
                return;
            }
        };

        let runner = TurnRunner::new(
            self.speaker.clone() as Arc<dyn SpeakerControl>,
            self.speaker.clone() as Arc<dyn QuerySource>,
            buffer,
            BoundaryPolicy::from_config(&self.config.segment),
            self.config.timing.clone(),
            cancel,
            stream,
            self.last_seen,
        );
        match runner.run().await {
            Ok(TurnOutcome::Completed { reply }) => {
                self.chat.commit_reply(&reply);
                info!("reply complete ({} chars)", reply.chars().count());
            }
            Ok(TurnOutcome::Interrupted {
                record,
                stop_command,
            }) => {
                if stop_command {
                    // Consume the stop phrase so the next poll does not
                    // see it again.
                    self.last_seen = record.timestamp;
                    info!("playback stopped by voice command");
                } else {
                    // Leave the watermark alone; the next poll picks the
                    // interrupting query up as a fresh one.
                    info!("turn superseded by: {}", record.query);
                }
            }
            Err(e) => warn!("turn failed: {e}"),
        }
    }

    async fn stop_if_playing(&self) {
        match self.speaker.is_playing().await {
            Ok(true) => {
                if let Err(e) = self.speaker.pause().await {
                    warn!("pause failed: {e}");
                }
            }
            Ok(false) => {}
            Err(e) => warn!("play status check failed: {e}"),
        }
    }
}
