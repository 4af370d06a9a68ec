//! Streaming chat tests against a mock chat-completion endpoint.
//!
//! These exercise the full path: HTTP request shape, SSE decoding, delta
//! appends into the sentence buffer, history bookkeeping, and cancellation.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sona::config::ChatConfig;
use sona::{BoundaryPolicy, BridgeError, ChatClient, Extraction, SentenceBuffer};

fn test_config(server: &MockServer) -> ChatConfig {
    ChatConfig {
        api_base: server.uri(),
        api_key: "test-key-123".to_owned(),
        ..ChatConfig::default()
    }
}

fn sse_body(deltas: &[&str]) -> String {
    let mut body = String::new();
    for delta in deltas {
        let chunk = json!({ "choices": [{ "delta": { "content": delta } }] });
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

// ── happy path ──────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_deltas_become_speakable_fragments() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(sse_body(&["你好", "，", "世界。", "尾巴"])),
        )
        .mount(&server)
        .await;

    let mut client = ChatClient::new(test_config(&server));
    let buffer = Arc::new(SentenceBuffer::new());
    let cancel = CancellationToken::new();

    let stream = client
        .begin_stream("打个招呼", buffer.writer(), cancel)
        .await
        .expect("stream should start");
    let reply = stream.join().await.expect("stream should complete");
    assert_eq!(reply, "你好，世界。尾巴");

    // Everything up to the right-most boundary comes out as one fragment,
    // the unpunctuated tail via the final flush.
    let policy = BoundaryPolicy::new("，。", "。", 3);
    match buffer.try_extract(policy.active_set(0)) {
        Extraction::Fragment(s) => assert_eq!(s, "你好，世界。"),
        other => panic!("expected fragment, got {other:?}"),
    }
    assert_eq!(buffer.take_remainder(), Some("尾巴".to_owned()));
    assert!(buffer.is_drained(true));
}

#[tokio::test]
async fn request_carries_auth_model_and_sampling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer test-key-123"))
        .and(body_partial_json(json!({
            "model": "gpt-3.5-turbo",
            "stream": true,
            "temperature": 0.5,
            "top_p": 1.0,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string("data: [DONE]\n\n"))
        .expect(1)
        .mount(&server)
        .await;

    let mut client = ChatClient::new(test_config(&server));
    let buffer = Arc::new(SentenceBuffer::new());

    let stream = client
        .begin_stream("hi", buffer.writer(), CancellationToken::new())
        .await
        .expect("stream should start");
    assert_eq!(stream.join().await.expect("empty stream"), "");
}

#[tokio::test]
async fn history_keeps_user_message_and_committed_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sse_body(&["好的。"])))
        .mount(&server)
        .await;

    let mut client = ChatClient::new(test_config(&server));
    let buffer = Arc::new(SentenceBuffer::new());

    let stream = client
        .begin_stream("第一个问题", buffer.writer(), CancellationToken::new())
        .await
        .expect("stream should start");
    let reply = stream.join().await.expect("stream should complete");
    client.commit_reply(&reply);

    let history = client.history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].content, "第一个问题");
    assert_eq!(history[2].content, "好的。");
}

// ── failure paths ───────────────────────────────────────────────────────

#[tokio::test]
async fn rejected_request_fails_before_any_playback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "invalid api key", "type": "auth" }
        })))
        .mount(&server)
        .await;

    let mut client = ChatClient::new(test_config(&server));
    let buffer = Arc::new(SentenceBuffer::new());

    let err = client
        .begin_stream("问题", buffer.writer(), CancellationToken::new())
        .await
        .expect_err("401 should fail the turn");
    assert!(err.to_string().contains("invalid api key"), "{err}");

    // Nothing reached the buffer, and the user message stays recorded.
    assert!(buffer.is_drained(true));
    assert_eq!(client.history().len(), 2);
    assert_eq!(client.history()[1].content, "问题");
}

#[tokio::test]
async fn malformed_payload_fails_the_stream() {
    let server = MockServer::start().await;
    let before = json!({ "choices": [{ "delta": { "content": "第一句。" } }] });
    let after = json!({ "choices": [{ "delta": { "content": "第二句。" } }] });
    let body =
        format!("data: {before}\n\ndata: {{\"choices\": oops}}\n\ndata: {after}\n\ndata: [DONE]\n\n");
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let mut client = ChatClient::new(test_config(&server));
    let buffer = Arc::new(SentenceBuffer::new());

    let stream = client
        .begin_stream("问题", buffer.writer(), CancellationToken::new())
        .await
        .expect("request itself succeeds");
    let err = stream.join().await.expect_err("garbage delta fails the stream");
    assert!(matches!(err, BridgeError::Chat(_)), "{err}");
    assert!(err.to_string().contains("malformed stream payload"), "{err}");

    // Deltas before the bad line reached the buffer; nothing after it did.
    let policy = BoundaryPolicy::new("。", "。", 3);
    match buffer.try_extract(policy.active_set(0)) {
        Extraction::Fragment(s) => assert_eq!(s, "第一句。"),
        other => panic!("expected fragment, got {other:?}"),
    }
    assert_eq!(buffer.take_remainder(), None);
}

#[tokio::test]
async fn cancelled_stream_appends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(sse_body(&["不该", "被播", "放。"])),
        )
        .mount(&server)
        .await;

    let mut client = ChatClient::new(test_config(&server));
    let buffer = Arc::new(SentenceBuffer::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let stream = client
        .begin_stream("问题", buffer.writer(), cancel)
        .await
        .expect("request itself succeeds");
    let reply = stream.join().await.expect("cancelled producer still joins");

    assert_eq!(reply, "");
    assert!(buffer.is_drained(true));
    assert_eq!(buffer.take_remainder(), None);
}
