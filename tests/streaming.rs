//! End-to-end over the reqwest transport against mock backends.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use wingman::provider::ContinuationToken;
use wingman::{
    Adapter, Backend, Client, ClientSettings, ConversationTurn, Credential, GenerationRequest,
    ProviderSettings, ReqwestTransport, Session, TextDelta,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(backend: Backend, server: &MockServer) -> Client {
    let settings = ProviderSettings::for_backend(backend)
        .unwrap()
        .with_base_url(&server.uri())
        .unwrap()
        .with_credential(Credential::ApiKey("test-key".into()));
    let adapter = Adapter::new(backend, settings).unwrap();
    let transport = ReqwestTransport::with_default_client().unwrap();
    Client::new(adapter, Arc::new(transport), ClientSettings::for_backend(backend))
}

fn ask(client: &Client, text: &str) -> GenerationRequest {
    client.chat_request(vec![ConversationTurn::system("sys"), ConversationTurn::user(text)])
}

fn sse(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

#[tokio::test]
async fn anthropic_event_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({ "stream": true, "system": "sys" })))
        .respond_with(sse(
            "event: content_block_delta\n\
             data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"Hello\"}}\n\n\
             data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\" world\"}}\n\n\
             data: [DONE]\n\n",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(Backend::Anthropic, &server);
    let deltas: Vec<TextDelta> = client.stream(&ask(&client, "hi"), CancellationToken::new()).collect().await;

    assert_eq!(
        deltas,
        vec![
            TextDelta::ContentDelta("Hello".into()),
            TextDelta::ContentDelta(" world".into()),
            TextDelta::Done { continuation: None },
        ]
    );
}

#[tokio::test]
async fn ollama_concatenated_objects() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({ "stream": true, "prompt": "hi", "system": "sys" })))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"response\":\"ab\",\"done\":false}\n{\"response\":\"cd\",\"done\":true,\"context\":[1,2]}",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(Backend::Ollama, &server);
    let deltas: Vec<TextDelta> = client.stream(&ask(&client, "hi"), CancellationToken::new()).collect().await;

    assert_eq!(
        deltas,
        vec![
            TextDelta::ContentDelta("ab".into()),
            TextDelta::ContentDelta("cd".into()),
            TextDelta::Done {
                continuation: Some(ContinuationToken(json!([1, 2])))
            },
        ]
    );
}

#[cfg(feature = "google")]
#[tokio::test]
async fn gemini_event_stream() {
    use wiremock::matchers::query_param;

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-flash:streamGenerateContent"))
        .and(query_param("alt", "sse"))
        .and(header("x-goog-api-key", "test-key"))
        .respond_with(sse(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}\r\n\r\n\
             data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" there\"}]},\"finishReason\":\"STOP\"}]}\r\n\r\n",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(Backend::Google, &server);
    let texts: Vec<String> = client
        .stream(&ask(&client, "hi"), CancellationToken::new())
        .filter_map(|d| d.text().map(str::to_string))
        .collect()
        .await;
    assert_eq!(texts, vec!["Hi", " there"]);
}

#[tokio::test]
async fn non_2xx_becomes_one_labeled_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(Backend::OpenAi, &server);
    let deltas: Vec<TextDelta> = client.stream(&ask(&client, "hi"), CancellationToken::new()).collect().await;

    assert_eq!(deltas.len(), 1);
    match &deltas[0] {
        TextDelta::Error(msg) => {
            assert!(msg.starts_with("openai request failed"), "{msg}");
            assert!(msg.contains("429"), "{msg}");
            assert!(msg.contains("rate limited"), "{msg}");
        }
        other => panic!("expected an error delta, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_before_send_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(Backend::Anthropic, &server);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let deltas: Vec<TextDelta> = client.stream(&ask(&client, "hi"), cancel.clone()).collect().await;
    assert!(deltas.is_empty());

    let reply = client.complete(&ask(&client, "hi"), &cancel).await;
    assert!(reply.aborted);
    assert!(reply.text.is_empty());

    let mut session = Session::new("sys");
    let reply = client.chat(&mut session, ConversationTurn::user("hi"), &cancel, |_| {}).await;
    assert!(reply.aborted);
    assert_eq!(session.turns().len(), 3);
}

#[tokio::test]
async fn cancel_while_waiting_for_headers_ends_promptly() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{\"response\":\"late\",\"done\":true}")
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let client = client_for(Backend::Ollama, &server);
    let cancel = CancellationToken::new();
    let stream = client.stream(&ask(&client, "hi"), cancel.clone());

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let deltas: Vec<TextDelta> = tokio::time::timeout(Duration::from_secs(3), stream.collect())
        .await
        .expect("stream should end soon after cancel");
    assert!(deltas.is_empty());
}

#[tokio::test]
async fn non_streaming_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "stream": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "full text" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let settings = ProviderSettings::for_backend(Backend::OpenAi)
        .unwrap()
        .with_base_url(&server.uri())
        .unwrap()
        .with_credential(Credential::BearerToken("test-key".into()));
    let client = Client::new(
        Adapter::new(Backend::OpenAi, settings).unwrap(),
        Arc::new(ReqwestTransport::with_default_client().unwrap()),
        ClientSettings::for_backend(Backend::OpenAi),
    );

    let reply = client.complete(&ask(&client, "hi"), &CancellationToken::new()).await;
    assert_eq!(reply.text, "full text");
    assert_eq!(reply.error, None);
    assert!(!reply.aborted);
}

#[tokio::test]
async fn ollama_chat_threads_context_between_rounds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"response\":\"first\",\"done\":true,\"context\":[1,2]}",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({ "prompt": "again", "context": [1, 2] })))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"response\":\"second\",\"done\":true,\"context\":[1,2,3]}",
        ))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(Backend::Ollama, &server);
    let mut session = Session::new("sys");
    let cancel = CancellationToken::new();

    let reply = client.chat(&mut session, ConversationTurn::user("hello"), &cancel, |_| {}).await;
    assert_eq!(reply.text, "first");
    let reply = client.chat(&mut session, ConversationTurn::user("again"), &cancel, |_| {}).await;
    assert_eq!(reply.text, "second");

    assert_eq!(session.continuation(), Some(&ContinuationToken(json!([1, 2, 3]))));
    let contents: Vec<&str> = session.turns().iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["sys", "hello", "first", "again", "second"]);
}

/// Answers every request with a 500 whose body never finishes, and holds the
/// socket open.
async fn stalled_error_body() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 1000\r\n\r\npartial")
                .await;
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

fn ollama_at(base: &str, timeout: Duration) -> Client {
    let settings = ProviderSettings::for_backend(Backend::Ollama)
        .unwrap()
        .with_base_url(base)
        .unwrap()
        .with_timeout(timeout);
    Client::new(
        Adapter::new(Backend::Ollama, settings).unwrap(),
        Arc::new(ReqwestTransport::with_default_client().unwrap()),
        ClientSettings::for_backend(Backend::Ollama),
    )
}

#[tokio::test]
async fn stalled_error_body_gives_way_to_cancel() {
    let base = stalled_error_body().await;
    let client = ollama_at(&base, Duration::from_secs(15));
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let reply = tokio::time::timeout(Duration::from_secs(5), client.complete(&ask(&client, "hi"), &cancel))
        .await
        .expect("complete should return soon after cancel");
    assert!(reply.aborted);
    assert_eq!(reply.error, None);
}

#[tokio::test]
async fn stalled_error_body_gives_way_to_timeout() {
    let base = stalled_error_body().await;
    let client = ollama_at(&base, Duration::from_secs(1));

    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        client.complete(&ask(&client, "hi"), &CancellationToken::new()),
    )
    .await
    .expect("complete should return once the request times out");
    assert!(reply.aborted);

    let deltas: Vec<TextDelta> = tokio::time::timeout(
        Duration::from_secs(5),
        client.stream(&ask(&client, "hi"), CancellationToken::new()).collect(),
    )
    .await
    .expect("stream should end once the request times out");
    assert!(deltas.is_empty());
}
