//! Per-turn playback coordination.
//!
//! [`TurnRunner`] drives one assistant turn: it pulls speakable fragments out
//! of the shared [`SentenceBuffer`] as the producer task fills it, speaks
//! each fragment once the device is quiet, and watches the conversation log
//! for a barge-in the whole time. A turn ends with the reply fully spoken,
//! with an interruption record the caller dispatches next, or with an error
//! when the cloud session stays broken after its renew-and-retry.
//!
//! Three polling cadences interleave here: fast local extraction retries,
//! the remote play-status poll, and the slower remote query poll. The query
//! poll rides on its own timer so it fires at the same rate no matter which
//! wait the runner is currently in.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::CompletionStream;
use crate::command::is_stop_command;
use crate::config::TimingConfig;
use crate::error::{BridgeError, Result};
use crate::segment::{BoundaryPolicy, Extraction, SentenceBuffer};
use crate::speaker::{QueryRecord, QuerySource, SpeakerControl};

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    /// The reply was spoken to the end; `reply` is the full assistant text.
    Completed { reply: String },
    /// A newer query arrived mid-turn. `stop_command` marks the pure
    /// stop phrases that should not be forwarded anywhere.
    Interrupted {
        record: QueryRecord,
        stop_command: bool,
    },
}

/// What the playback loop decided before teardown.
enum Step {
    /// Buffer drained, producer finished and the device back to quiet; the
    /// reply is complete.
    Drained,
    /// A strictly newer query arrived.
    Interrupted(QueryRecord),
}

/// Drives playback for a single assistant turn.
pub struct TurnRunner {
    speaker: Arc<dyn SpeakerControl>,
    queries: Arc<dyn QuerySource>,
    buffer: Arc<SentenceBuffer>,
    policy: BoundaryPolicy,
    timing: TimingConfig,
    cancel: CancellationToken,
    stream: CompletionStream,
    last_seen: i64,
    hits: usize,
    last_query_poll: Instant,
}

impl TurnRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        speaker: Arc<dyn SpeakerControl>,
        queries: Arc<dyn QuerySource>,
        buffer: Arc<SentenceBuffer>,
        policy: BoundaryPolicy,
        timing: TimingConfig,
        cancel: CancellationToken,
        stream: CompletionStream,
        last_seen: i64,
    ) -> Self {
        Self {
            speaker,
            queries,
            buffer,
            policy,
            timing,
            cancel,
            stream,
            last_seen,
            hits: 0,
            last_query_poll: Instant::now(),
        }
    }

    /// Run the turn to completion or interruption.
    ///
    /// A status or query poll that still fails after the session layer's
    /// renew-and-retry aborts the turn: the producer is cancelled, unspoken
    /// text is dropped and the error surfaces to the caller.
    pub async fn run(mut self) -> Result<TurnOutcome> {
        match self.drive().await {
            Ok(Step::Drained) => {
                let reply = self.stream.join().await?;
                debug!("turn complete, reply fully spoken");
                Ok(TurnOutcome::Completed { reply })
            }
            Ok(Step::Interrupted(record)) => self.finish_interrupted(record).await,
            Err(e) => self.abort(e).await,
        }
    }

    async fn drive(&mut self) -> Result<Step> {
        loop {
            if let Some(record) = self.poll_interrupt().await? {
                return Ok(Step::Interrupted(record));
            }
            match self.buffer.try_extract(self.policy.active_set(self.hits)) {
                Extraction::Fragment(fragment) => {
                    if let Some(record) = self.speak_when_idle(&fragment).await? {
                        return Ok(Step::Interrupted(record));
                    }
                }
                Extraction::Contended => {
                    sleep(Duration::from_millis(self.timing.extract_backoff_ms)).await;
                }
                Extraction::NoBoundary => {
                    if !self.stream.is_finished() {
                        sleep(Duration::from_millis(self.timing.extract_backoff_ms)).await;
                        continue;
                    }
                    match self.buffer.take_remainder() {
                        Some(tail) => {
                            // The reply's tail rarely ends in punctuation
                            // but must be spoken all the same.
                            if let Some(record) = self.speak_when_idle(&tail).await? {
                                return Ok(Step::Interrupted(record));
                            }
                        }
                        None => {
                            // Hold the turn open while the last utterance
                            // plays out; a barge-in still lands here, not
                            // in the next turn.
                            return match self.wait_for_idle().await? {
                                Some(record) => Ok(Step::Interrupted(record)),
                                None => Ok(Step::Drained),
                            };
                        }
                    }
                }
            }
        }
    }

    /// Wait for the device to go quiet, then speak one fragment.
    ///
    /// The fragment is held while the device is busy, never dropped; only a
    /// barge-in (returned as `Some`) abandons it. A failed TTS command loses
    /// just this fragment and the turn carries on; a failed status poll
    /// aborts the whole turn.
    async fn speak_when_idle(&mut self, fragment: &str) -> Result<Option<QueryRecord>> {
        if let Some(record) = self.wait_for_idle().await? {
            return Ok(Some(record));
        }
        self.hits += self.policy.count_hits(fragment);
        info!("speak: {fragment}");
        if let Err(e) = self.speaker.speak(fragment).await {
            warn!("tts command failed, fragment dropped: {e}");
        }
        Ok(None)
    }

    /// Poll the device until it reports idle, watching the query log the
    /// whole time. Returns the record of any barge-in seen while waiting.
    async fn wait_for_idle(&mut self) -> Result<Option<QueryRecord>> {
        loop {
            if let Some(record) = self.poll_interrupt().await? {
                return Ok(Some(record));
            }
            if !self.speaker.is_playing().await? {
                return Ok(None);
            }
            sleep(Duration::from_millis(self.timing.idle_poll_ms)).await;
        }
    }

    /// One query-log poll, rate-limited to the configured cadence. Returns
    /// a record strictly newer than the turn's triggering query.
    async fn poll_interrupt(&mut self) -> Result<Option<QueryRecord>> {
        if self.last_query_poll.elapsed() < Duration::from_millis(self.timing.query_poll_ms) {
            return Ok(None);
        }
        self.last_query_poll = Instant::now();
        let record = self.queries.latest_query().await?;
        Ok(record.filter(|r| r.timestamp > self.last_seen))
    }

    /// Tear the turn down after a barge-in: stop the producer, drop all
    /// unspoken text, silence the device, classify the new query.
    async fn finish_interrupted(self, record: QueryRecord) -> Result<TurnOutcome> {
        info!("barge-in: {}", record.query);
        self.cancel.cancel();
        self.buffer.clear();
        if let Err(e) = self.speaker.pause().await {
            warn!("pause after barge-in failed: {e}");
        }
        // The empty utterance knocks the device out of its own reply;
        // without it some firmware keeps talking over the next turn.
        if let Err(e) = self.speaker.speak("").await {
            warn!("barge-in mute failed: {e}");
        }
        let stop_command = is_stop_command(&record.query);
        if let Err(e) = self.stream.join().await {
            debug!("stream task after barge-in: {e}");
        }
        Ok(TurnOutcome::Interrupted {
            record,
            stop_command,
        })
    }

    /// Tear the turn down after a transport failure: stop the producer, drop
    /// all unspoken text, surface the original error.
    async fn abort(self, err: BridgeError) -> Result<TurnOutcome> {
        self.cancel.cancel();
        self.buffer.clear();
        if let Err(e) = self.stream.join().await {
            debug!("stream task after turn abort: {e}");
        }
        Err(err)
    }
}
