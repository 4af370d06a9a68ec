//! Vendor cloud client for the speaker.
//!
//! Three remote surfaces, all cookie-authenticated:
//! - device directory (`/admin/v2/device_list`) to resolve the configured
//!   hardware code into a device id,
//! - ubus command channel (`/remote/ubus`) for TTS, play status and pause,
//! - conversation log (`/device_profile/v2/conversation`) for query polling.
//!
//! The conversation and status endpoints double-encode their payloads: the
//! interesting field arrives as a JSON string inside the JSON body.
//!
//! Sessions go stale without warning, so the polled operations retry once
//! after a renew; one-shot commands like [`SpeakerControl::speak`] surface
//! the error and let the caller decide.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::COOKIE;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{SpeakerConfig, TimingConfig};
use crate::error::{BridgeError, Result};
use crate::speaker::auth::{self, AuthTokens, TokenStore};
use crate::speaker::{QueryRecord, QuerySource, SpeakerControl};

/// One entry from the account's device directory.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(default)]
    pub hardware: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone)]
struct Session {
    device_id: String,
    cookie: String,
}

/// Cloud-backed implementation of [`QuerySource`] and [`SpeakerControl`].
pub struct CloudSpeaker {
    http: reqwest::Client,
    config: SpeakerConfig,
    timing: TimingConfig,
    store: TokenStore,
    session: RwLock<Option<Session>>,
}

impl CloudSpeaker {
    pub fn new(config: SpeakerConfig, timing: TimingConfig) -> Self {
        let store = TokenStore::new(config.token_path());
        Self {
            http: reqwest::Client::new(),
            config,
            timing,
            store,
            session: RwLock::new(None),
        }
    }

    /// Log in from scratch and rebuild the device session.
    pub async fn renew(&self) -> Result<()> {
        *self.write_session() = None;
        let tokens = auth::login(
            &self.http,
            &self.config.account_url,
            &self.config.account,
            &self.config.password,
        )
        .await?;
        if let Err(e) = self.store.save(&tokens) {
            warn!("token cache not persisted: {e}");
        }
        self.install_session(&tokens).await?;
        Ok(())
    }

    /// Establish the session at startup, reusing persisted tokens when they
    /// still work. A cached token the cloud rejects falls back to one fresh
    /// login; bad credentials and unknown hardware stay fatal.
    pub async fn connect(&self) -> Result<()> {
        let had_cache = self.store.load().is_some();
        match self.ensure_session().await {
            Ok(_) => Ok(()),
            Err(BridgeError::Auth(e)) if had_cache => {
                warn!("cached session rejected, logging in fresh: {e}");
                self.renew().await
            }
            Err(e) => Err(e),
        }
    }

    /// List devices registered to the account.
    pub async fn device_list(&self) -> Result<Vec<DeviceInfo>> {
        let tokens = self.obtain_tokens().await?;
        self.fetch_devices(&tokens).await
    }

    /// Current session, bootstrapping from the token cache or a fresh
    /// login when none is installed yet.
    async fn ensure_session(&self) -> Result<Session> {
        if let Some(session) = self.read_session() {
            return Ok(session);
        }
        match self.store.load() {
            Some(tokens) => self.install_session(&tokens).await,
            None => {
                let tokens = self.obtain_tokens().await?;
                self.install_session(&tokens).await
            }
        }
    }

    async fn obtain_tokens(&self) -> Result<AuthTokens> {
        if let Some(tokens) = self.store.load() {
            return Ok(tokens);
        }
        let tokens = auth::login(
            &self.http,
            &self.config.account_url,
            &self.config.account,
            &self.config.password,
        )
        .await?;
        if let Err(e) = self.store.save(&tokens) {
            warn!("token cache not persisted: {e}");
        }
        Ok(tokens)
    }

    /// Resolve the configured hardware to a device id and install the
    /// session cookie.
    async fn install_session(&self, tokens: &AuthTokens) -> Result<Session> {
        let devices = self.fetch_devices(tokens).await?;
        let device = devices
            .iter()
            .find(|d| d.hardware == self.config.hardware)
            .ok_or_else(|| {
                let seen: Vec<&str> = devices.iter().map(|d| d.hardware.as_str()).collect();
                BridgeError::Device(format!(
                    "no device with hardware {}; account has: [{}]",
                    self.config.hardware,
                    seen.join(", ")
                ))
            })?;

        let session = Session {
            device_id: device.device_id.clone(),
            cookie: device_cookie(tokens, &device.device_id),
        };
        info!(
            "speaker session ready: {} ({}, {})",
            device.name, self.config.hardware, device.device_id
        );
        *self.write_session() = Some(session.clone());
        Ok(session)
    }

    async fn fetch_devices(&self, tokens: &AuthTokens) -> Result<Vec<DeviceInfo>> {
        let url = format!("{}/admin/v2/device_list", self.config.service_url);
        let response = self
            .http
            .get(&url)
            .header(COOKIE, auth_cookie(tokens))
            .send()
            .await
            .map_err(|e| BridgeError::Transport(format!("device list: {e}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BridgeError::Auth("device list rejected the session".into()));
        }
        if !status.is_success() {
            return Err(BridgeError::Transport(format!("device list HTTP {status}")));
        }

        let envelope: DeviceListEnvelope = response
            .json()
            .await
            .map_err(|e| BridgeError::Transport(format!("device list body: {e}")))?;
        if envelope.code != 0 {
            return Err(BridgeError::Device(format!(
                "device list returned code {}",
                envelope.code
            )));
        }
        Ok(envelope.data)
    }

    /// Send one ubus command to the device and return the reply body.
    async fn ubus(
        &self,
        session: &Session,
        method: &str,
        path: &str,
        message: Value,
    ) -> Result<Value> {
        let url = format!("{}/remote/ubus", self.config.service_url);
        let request_id = format!("app_ios_{}", Uuid::new_v4().simple());
        let message = message.to_string();
        let form = [
            ("deviceId", session.device_id.as_str()),
            ("message", message.as_str()),
            ("method", method),
            ("path", path),
            ("requestId", request_id.as_str()),
        ];
        debug!("ubus {method} on {path}");

        let response = self
            .http
            .post(&url)
            .header(COOKIE, session.cookie.as_str())
            .form(&form)
            .send()
            .await
            .map_err(|e| BridgeError::Transport(format!("ubus {method}: {e}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BridgeError::Auth(format!("ubus {method} rejected the session")));
        }
        if !status.is_success() {
            return Err(BridgeError::Transport(format!("ubus {method} HTTP {status}")));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| BridgeError::Transport(format!("ubus {method} body: {e}")))?;
        let code = reply.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            return Err(BridgeError::Transport(format!(
                "ubus {method} returned code {code}"
            )));
        }
        Ok(reply)
    }

    async fn fetch_latest(&self) -> Result<Option<QueryRecord>> {
        let session = self.ensure_session().await?;
        let url = format!(
            "{}/device_profile/v2/conversation?source=dialogu&hardware={}&timestamp={}&limit=2",
            self.config.profile_url,
            self.config.hardware,
            chrono::Utc::now().timestamp_millis()
        );
        trace!("polling conversation log");

        let response = self
            .http
            .get(&url)
            .header(COOKIE, session.cookie.as_str())
            .send()
            .await
            .map_err(|e| BridgeError::Transport(format!("conversation poll: {e}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BridgeError::Auth("conversation poll rejected the session".into()));
        }
        if !status.is_success() {
            return Err(BridgeError::Transport(format!(
                "conversation poll HTTP {status}"
            )));
        }

        let envelope: ConversationEnvelope = response
            .json()
            .await
            .map_err(|e| BridgeError::Transport(format!("conversation body: {e}")))?;
        parse_conversation(&envelope)
    }

    async fn fetch_play_status(&self) -> Result<bool> {
        let session = self.ensure_session().await?;
        let reply = self
            .ubus(&session, "player_get_play_status", "mediaplayer", json!({}))
            .await?;
        Ok(playing_status(&reply))
    }

    async fn backoff_then_renew(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(self.timing.reauth_backoff_ms)).await;
        self.renew().await
    }

    /// Run the configured TTS binary instead of the cloud TTS command.
    async fn local_tts(&self, text: &str) -> Result<()> {
        let slot = self
            .config
            .tts_slots
            .get(&self.config.hardware)
            .ok_or_else(|| {
                BridgeError::Config(format!(
                    "no tts slot mapped for hardware {}",
                    self.config.hardware
                ))
            })?;
        let output = tokio::process::Command::new(&self.config.tts_bin)
            .arg(slot)
            .arg(text)
            .output()
            .await?;
        if !output.status.success() {
            return Err(BridgeError::Transport(format!(
                "{} exited with {}",
                self.config.tts_bin, output.status
            )));
        }
        Ok(())
    }

    fn read_session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_session(&self) -> std::sync::RwLockWriteGuard<'_, Option<Session>> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QuerySource for CloudSpeaker {
    async fn latest_query(&self) -> Result<Option<QueryRecord>> {
        match self.fetch_latest().await {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!("conversation poll failed, renewing session: {e}");
                self.backoff_then_renew().await?;
                self.fetch_latest().await
            }
        }
    }
}

#[async_trait]
impl SpeakerControl for CloudSpeaker {
    async fn is_playing(&self) -> Result<bool> {
        match self.fetch_play_status().await {
            Ok(playing) => Ok(playing),
            Err(e) => {
                warn!("play status failed, renewing session: {e}");
                self.backoff_then_renew().await?;
                self.fetch_play_status().await
            }
        }
    }

    async fn speak(&self, text: &str) -> Result<()> {
        if self.config.use_local_tts {
            return self.local_tts(text).await;
        }
        let session = self.ensure_session().await?;
        self.ubus(&session, "text_to_speech", "mibrain", json!({ "text": text }))
            .await?;
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        let session = self.ensure_session().await?;
        self.ubus(
            &session,
            "player_play_operation",
            "mediaplayer",
            json!({ "action": "pause", "media": "app_ios" }),
        )
        .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DeviceListEnvelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    data: Vec<DeviceInfo>,
}

#[derive(Debug, Deserialize)]
struct ConversationEnvelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConversationPayload {
    #[serde(default)]
    records: Vec<RawRecord>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    time: i64,
    query: String,
    #[serde(default)]
    answers: Vec<RawAnswer>,
}

#[derive(Debug, Deserialize)]
struct RawAnswer {
    #[serde(default)]
    tts: Option<RawTts>,
}

#[derive(Debug, Deserialize)]
struct RawTts {
    #[serde(default)]
    text: String,
}

/// Decode the conversation envelope. The `data` field is itself a JSON
/// document; records arrive newest-first.
fn parse_conversation(envelope: &ConversationEnvelope) -> Result<Option<QueryRecord>> {
    if envelope.code != 0 {
        return Err(BridgeError::Transport(format!(
            "conversation poll returned code {}",
            envelope.code
        )));
    }
    let Some(data) = envelope.data.as_deref() else {
        return Ok(None);
    };
    let payload: ConversationPayload = serde_json::from_str(data)
        .map_err(|e| BridgeError::Transport(format!("conversation payload: {e}")))?;

    Ok(payload.records.first().map(|record| QueryRecord {
        timestamp: record.time,
        query: record.query.clone(),
        answer: record
            .answers
            .first()
            .and_then(|a| a.tts.as_ref())
            .map(|tts| tts.text.clone()),
    }))
}

/// `data.info` is a JSON string; `status == 1` means audio is playing.
fn playing_status(reply: &Value) -> bool {
    let info = reply
        .pointer("/data/info")
        .and_then(Value::as_str)
        .unwrap_or("{}");
    serde_json::from_str::<Value>(info)
        .ok()
        .and_then(|v| v.get("status").and_then(Value::as_i64))
        == Some(1)
}

fn auth_cookie(tokens: &AuthTokens) -> String {
    format!(
        "serviceToken={}; userId={}",
        tokens.service_token, tokens.user_id
    )
}

fn device_cookie(tokens: &AuthTokens, device_id: &str) -> String {
    format!(
        "deviceId={device_id}; serviceToken={}; userId={}",
        tokens.service_token, tokens.user_id
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    // ── conversation decoding ───────────────────────────────────────────

    fn envelope(data: Option<&str>) -> ConversationEnvelope {
        ConversationEnvelope {
            code: 0,
            data: data.map(str::to_owned),
        }
    }

    #[test]
    fn conversation_unwraps_double_encoded_records() {
        let inner = serde_json::json!({
            "records": [
                {
                    "time": 1_700_000_001_000_i64,
                    "query": "今天天气怎么样",
                    "answers": [{ "tts": { "text": "今天晴" } }]
                },
                {
                    "time": 1_700_000_000_000_i64,
                    "query": "早",
                    "answers": []
                }
            ]
        });
        let record = parse_conversation(&envelope(Some(&inner.to_string())))
            .unwrap()
            .unwrap();

        assert_eq!(record.timestamp, 1_700_000_001_000);
        assert_eq!(record.query, "今天天气怎么样");
        assert_eq!(record.answer.as_deref(), Some("今天晴"));
    }

    #[test]
    fn conversation_without_answers_yields_none_answer() {
        let inner = r#"{"records":[{"time":5,"query":"hi","answers":[]}]}"#;
        let record = parse_conversation(&envelope(Some(inner))).unwrap().unwrap();
        assert_eq!(record.answer, None);
    }

    #[test]
    fn conversation_empty_records_is_no_query() {
        let inner = r#"{"records":[]}"#;
        assert!(parse_conversation(&envelope(Some(inner))).unwrap().is_none());
    }

    #[test]
    fn conversation_missing_data_is_no_query() {
        assert!(parse_conversation(&envelope(None)).unwrap().is_none());
    }

    #[test]
    fn conversation_error_code_is_transport_error() {
        let bad = ConversationEnvelope {
            code: 401,
            data: None,
        };
        assert!(parse_conversation(&bad).is_err());
    }

    #[test]
    fn conversation_garbled_payload_is_transport_error() {
        assert!(parse_conversation(&envelope(Some("not json"))).is_err());
    }

    // ── play status decoding ────────────────────────────────────────────

    #[test]
    fn playing_status_reads_nested_info_string() {
        let playing = serde_json::json!({
            "code": 0,
            "data": { "info": r#"{"status":1,"volume":42}"# }
        });
        let idle = serde_json::json!({
            "code": 0,
            "data": { "info": r#"{"status":2,"volume":42}"# }
        });
        assert!(playing_status(&playing));
        assert!(!playing_status(&idle));
    }

    #[test]
    fn playing_status_defaults_to_idle_on_malformed_reply() {
        assert!(!playing_status(&serde_json::json!({ "code": 0 })));
        assert!(!playing_status(&serde_json::json!({
            "code": 0,
            "data": { "info": "garbled" }
        })));
    }

    // ── cookies ─────────────────────────────────────────────────────────

    #[test]
    fn device_cookie_carries_all_three_fields() {
        let tokens = AuthTokens {
            user_id: "8824".into(),
            service_token: "tok".into(),
        };
        assert_eq!(
            device_cookie(&tokens, "dev-1"),
            "deviceId=dev-1; serviceToken=tok; userId=8824"
        );
        assert_eq!(auth_cookie(&tokens), "serviceToken=tok; userId=8824");
    }

    // ── local tts ───────────────────────────────────────────────────────

    #[cfg(unix)]
    fn tts_stub(dir: &tempfile::TempDir, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("tts-stub.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    fn local_speaker(tts_bin: String, dir: &tempfile::TempDir) -> CloudSpeaker {
        let config = SpeakerConfig {
            hardware: "LX06".to_owned(),
            use_local_tts: true,
            tts_bin,
            token_file: Some(dir.path().join("tokens.json")),
            ..SpeakerConfig::default()
        };
        CloudSpeaker::new(config, TimingConfig::default())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn local_tts_invokes_slot_then_text() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("argv.txt");
        let script = tts_stub(&dir, &format!("printf '%s\\n' \"$@\" > \"{}\"", capture.display()));

        let speaker = local_speaker(script, &dir);
        speaker.speak("你好，世界").await.unwrap();

        // LX06 maps to slot 5-1 in the default table.
        let argv = std::fs::read_to_string(&capture).unwrap();
        assert_eq!(argv, "5-1\n你好，世界\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn local_tts_nonzero_exit_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = tts_stub(&dir, "exit 3");

        let speaker = local_speaker(script, &dir);
        let err = speaker.speak("你好").await.expect_err("stub exits nonzero");
        assert!(matches!(err, BridgeError::Transport(_)), "{err}");
        assert!(err.to_string().contains("exited"), "{err}");
    }
}
