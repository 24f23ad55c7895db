//! End-to-end gateway tests against mock upstreams.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use switchboard::config::{AppConfig, Protocol, ProviderEndpoint};
use switchboard::logging::{MemorySink, RequestStatus};
use switchboard::trace::Stage;
use switchboard::{ConfigStore, HealthRegistry};

struct Gateway {
    url: String,
    sink: Arc<MemorySink>,
    health: Arc<HealthRegistry>,
}

async fn spawn_gateway(config: AppConfig) -> Gateway {
    let store = Arc::new(ConfigStore::in_memory(config));
    let sink = Arc::new(MemorySink::new());
    let health = Arc::new(HealthRegistry::new(0.0));
    let state = switchboard_server::build_state(
        store,
        Arc::clone(&health),
        Arc::clone(&sink) as Arc<dyn switchboard::logging::LogSink>,
    )
    .unwrap();
    let app = switchboard_server::app(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Gateway {
        url: format!("http://{addr}"),
        sink,
        health,
    }
}

fn upstream_config(server: &MockServer, models: Vec<&str>) -> AppConfig {
    let mut config = AppConfig::default();
    config.providers.upstream = ProviderEndpoint {
        base_url: server.uri(),
        api_key: "up-key".to_string(),
        protocol: Protocol::OpenAi,
        verify_ssl: true,
    };
    config.models.t1 = models.into_iter().map(str::to_string).collect();
    config
}

async fn wait_for_log(sink: &MemorySink) {
    for _ in 0..50 {
        if !sink.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no request log arrived");
}

#[tokio::test]
async fn test_classifier_off_passthrough() {
    let upstream = MockServer::start().await;
    let body = json!({"choices": [{"message": {"role": "assistant", "content": "hello"}}]});
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body.clone()))
        .mount(&upstream)
        .await;

    let gateway = spawn_gateway(upstream_config(&upstream, vec!["gpt-mini"])).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.url))
        .json(&json!({"messages": [{"role": "user", "content": "hi"}], "stream": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let received: Value = response.json().await.unwrap();
    assert_eq!(received, body);

    wait_for_log(&gateway.sink).await;
    let records = gateway.sink.take();
    let record = &records[0];
    assert_eq!(record.status, RequestStatus::Success);
    assert_eq!(record.tier.as_str(), "t1");
    assert_eq!(record.chosen_model.as_deref(), Some("upstream/gpt-mini"));
    let stages: Vec<Stage> = record.trace.iter().map(|e| e.stage).collect();
    assert_eq!(
        stages,
        vec![Stage::ReqReceived, Stage::ModelCallStart, Stage::FullResponse]
    );
    assert!(record.prompt_tokens > 0);

    assert_eq!(gateway.health.snapshot()["upstream/gpt-mini"].success, 1);
}

#[tokio::test]
async fn test_failover_to_second_provider() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&a)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "from b"}}]
        })))
        .mount(&b)
        .await;

    let mut config = AppConfig::default();
    for (id, server) in [("a", &a), ("b", &b)] {
        config.providers.custom.insert(
            id.to_string(),
            ProviderEndpoint {
                base_url: server.uri(),
                api_key: String::new(),
                protocol: Protocol::OpenAi,
                verify_ssl: true,
            },
        );
    }
    config.models.t1 = vec!["a/x".to_string(), "b/y".to_string()];
    let gateway = spawn_gateway(config).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.url))
        .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let received: Value = response.json().await.unwrap();
    assert_eq!(received["choices"][0]["message"]["content"], "from b");

    wait_for_log(&gateway.sink).await;
    let records = gateway.sink.take();
    assert_eq!(records[0].retry_count, 1);
    let snapshot = gateway.health.snapshot();
    assert_eq!(snapshot["a/x"].failures, 1);
    assert_eq!(snapshot["b/y"].success, 1);
}

#[tokio::test]
async fn test_exhaustion_returns_502_envelope() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&upstream)
        .await;

    let gateway = spawn_gateway(upstream_config(&upstream, vec!["x", "y"])).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.url))
        .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let envelope: Value = response.json().await.unwrap();
    assert_eq!(envelope["error"]["kind"], "exhausted");
    assert_eq!(envelope["error"]["last_reason"], "http_5xx");
    assert_eq!(
        envelope["error"]["attempted"],
        json!(["upstream/x", "upstream/y"])
    );

    wait_for_log(&gateway.sink).await;
    let records = gateway.sink.take();
    assert_eq!(records[0].status, RequestStatus::Error);
    assert_eq!(
        records[0].trace.last().unwrap().stage,
        Stage::AllFailed
    );
}

#[tokio::test]
async fn test_empty_message_list_is_400() {
    let upstream = MockServer::start().await;
    let gateway = spawn_gateway(upstream_config(&upstream, vec!["x"])).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.url))
        .json(&json!({"messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_gateway_key_enforcement() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}]
        })))
        .mount(&upstream)
        .await;

    let mut config = upstream_config(&upstream, vec!["x"]);
    config.general.gateway_api_key = "gw-secret".to_string();
    let gateway = spawn_gateway(config).await;
    let client = reqwest::Client::new();
    let request_body = json!({"messages": [{"role": "user", "content": "hi"}]});

    // missing key
    let response = client
        .post(format!("{}/v1/chat/completions", gateway.url))
        .json(&request_body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(
        response.headers().get("www-authenticate").unwrap(),
        "Bearer"
    );

    // wrong key
    let response = client
        .post(format!("{}/v1/chat/completions", gateway.url))
        .bearer_auth("nope")
        .json(&request_body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // right key
    let response = client
        .post(format!("{}/v1/chat/completions", gateway.url))
        .bearer_auth("gw-secret")
        .json(&request_body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // status probe stays open
    let response = client
        .get(format!("{}/status", gateway.url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_list_models_unions_tiers() {
    let upstream = MockServer::start().await;
    let mut config = upstream_config(&upstream, vec!["alpha"]);
    config.models.t2 = vec!["beta".to_string(), "alpha".to_string()];
    config.models.t3 = vec!["gamma".to_string()];
    let gateway = spawn_gateway(config).await;

    let body: Value = reqwest::Client::new()
        .get(format!("{}/v1/models", gateway.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn test_streaming_passthrough_is_byte_identical() {
    let upstream = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body),
        )
        .mount(&upstream)
        .await;

    let gateway = spawn_gateway(upstream_config(&upstream, vec!["gpt-mini"])).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.url))
        .json(&json!({"messages": [{"role": "user", "content": "hi"}], "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let received = response.bytes().await.unwrap();
    assert_eq!(received.as_ref(), sse_body.as_bytes());

    wait_for_log(&gateway.sink).await;
    let records = gateway.sink.take();
    let record = &records[0];
    assert_eq!(record.status, RequestStatus::Success);
    assert_eq!(
        record.response_body["choices"][0]["message"]["content"],
        "Hello"
    );
    let stages: Vec<Stage> = record.trace.iter().map(|e| e.stage).collect();
    assert!(stages.contains(&Stage::FirstToken));
    assert_eq!(*stages.last().unwrap(), Stage::FullResponse);
    assert_eq!(gateway.health.snapshot()["upstream/gpt-mini"].success, 1);
}

#[tokio::test]
async fn test_streaming_client_over_buffered_flavor_gets_synthesized_sse() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "text", "text": "block reply"}],
            "usage": {"input_tokens": 3, "output_tokens": 4},
        })))
        .mount(&upstream)
        .await;

    let mut config = upstream_config(&upstream, vec!["claude-x"]);
    config.providers.upstream.protocol = Protocol::V1Messages;
    let gateway = spawn_gateway(config).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.url))
        .json(&json!({"messages": [{"role": "user", "content": "hi"}], "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let text = response.text().await.unwrap();
    assert!(text.contains("chat.completion.chunk"));
    assert!(text.contains("block reply"));
    assert!(text.trim_end().ends_with("data: [DONE]"));

    wait_for_log(&gateway.sink).await;
    assert_eq!(gateway.sink.take()[0].status, RequestStatus::Success);
}

/// Hand-rolled upstream that dies mid-stream: three SSE deltas over chunked
/// encoding, then the socket drops without a terminal chunk.
async fn flaky_sse_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
                let _ = socket.write_all(head.as_bytes()).await;
                for i in 0..3 {
                    let data =
                        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"d{i}\"}}}}]}}\n\n");
                    let chunk = format!("{:x}\r\n{}\r\n", data.len(), data);
                    let _ = socket.write_all(chunk.as_bytes()).await;
                    let _ = socket.flush().await;
                }
                // no 0-length terminator: abort mid-stream
            });
        }
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_mid_stream_abort_closes_with_error_and_done() {
    let upstream_url = flaky_sse_upstream().await;
    let mut config = AppConfig::default();
    config.providers.upstream = ProviderEndpoint {
        base_url: upstream_url,
        api_key: String::new(),
        protocol: Protocol::OpenAi,
        verify_ssl: true,
    };
    config.models.t1 = vec!["gpt-mini".to_string()];
    let gateway = spawn_gateway(config).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.url))
        .json(&json!({"messages": [{"role": "user", "content": "hi"}], "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => body.extend_from_slice(&bytes),
            Err(_) => break,
        }
    }
    let text = String::from_utf8_lossy(&body);
    // the three committed deltas arrive, then the error event and [DONE]
    assert!(text.contains("d0") && text.contains("d1") && text.contains("d2"));
    assert!(text.contains("\"error\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));

    wait_for_log(&gateway.sink).await;
    let records = gateway.sink.take();
    assert_eq!(records[0].status, RequestStatus::Error);

    let snapshot = gateway.health.snapshot();
    let stats = &snapshot["upstream/gpt-mini"];
    assert_eq!(stats.failures, 1);
    // stream_abort penalty
    assert!((stats.failure_score - 2.0).abs() < 1e-9);
}
