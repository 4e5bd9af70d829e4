use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clinical_contrast::gateway::provider::HttpChatAdapter;
use clinical_contrast::gateway::{
    Attribution, ChatModel, GatewayConfig, NoopUsageSink, Provider, ProviderGateway, RetryPolicy,
};
use clinical_contrast::prompts::{bindings, PromptTemplate};
use clinical_contrast::structured::{
    FieldType, ResponseSchema, SeedMode, StructuredCall, StructuredError, StructuredGateway,
    StructuredReply,
};
use serde::Deserialize;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const PICK: PromptTemplate = PromptTemplate {
    slug: "pick_answer",
    system: "Answer with JSON: {\"answer\": string}.",
    user: "<question>{question}</question>",
};

#[derive(Debug, Deserialize)]
struct Pick {
    answer: String,
}

impl StructuredReply for Pick {
    fn schema() -> ResponseSchema {
        ResponseSchema::new().field("answer", FieldType::String)
    }
}

/// Serves `replies` in order, repeating the last one.
struct SequenceResponder {
    calls: Arc<AtomicUsize>,
    replies: Vec<ResponseTemplate>,
}

impl Respond for SequenceResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies[n.min(self.replies.len() - 1)].clone()
    }
}

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 3, "completion_tokens": 5 }
    }))
}

async fn structured(server: &MockServer, max_retries: u32) -> StructuredGateway {
    let adapter = HttpChatAdapter::with_config(
        Provider::OpenAi,
        "sk-test",
        server.uri(),
        Duration::from_secs(5),
    )
    .unwrap();
    let gateway = ProviderGateway::new(Arc::new(NoopUsageSink), GatewayConfig::default())
        .with_adapter(Provider::OpenAi, Arc::new(adapter));
    StructuredGateway::new(
        Arc::new(gateway),
        ChatModel::new(Provider::OpenAi, "gpt-4.1-mini"),
        RetryPolicy::immediate(max_retries),
    )
}

fn call() -> StructuredCall<'static> {
    StructuredCall::new(
        &PICK,
        bindings([("question", "Which drug?".to_string())]),
        Attribution::new("test").with_question("q1"),
    )
}

#[tokio::test]
async fn two_malformed_replies_then_valid_counts_two_retries() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(SequenceResponder {
            calls: calls.clone(),
            replies: vec![
                completion("Sure! The answer is metformin."),
                completion(r#"{"choice": "metformin"}"#),
                completion(r#"{"answer": "metformin"}"#),
            ],
        })
        .mount(&server)
        .await;

    let structured = structured(&server, 3).await.seed_mode(SeedMode::Fixed(11));
    let reply = structured.call::<Pick>(call()).await.unwrap();

    assert_eq!(reply.value.answer, "metformin");
    assert_eq!(reply.retry_count, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let received = server.received_requests().await.unwrap();
    let bodies: Vec<serde_json::Value> = received
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();

    // Same seed on every attempt; corrections replace each other instead of piling up.
    assert!(bodies.iter().all(|b| b["seed"] == 11));
    assert_eq!(bodies[0]["messages"].as_array().unwrap().len(), 2);
    let last = bodies[2]["messages"].as_array().unwrap();
    assert_eq!(last.len(), 4);
    assert_eq!(last[2]["role"], "assistant");
    assert_eq!(last[2]["content"], r#"{"choice": "metformin"}"#);
    assert_eq!(last[3]["role"], "user");
    assert!(last[3]["content"].as_str().unwrap().contains("answer"));
}

#[tokio::test]
async fn server_error_is_retried_within_the_same_budget() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(SequenceResponder {
            calls: calls.clone(),
            replies: vec![
                ResponseTemplate::new(500).set_body_json(json!({
                    "error": { "message": "transient error", "code": "internal" }
                })),
                completion(r#"{"answer": "ok"}"#),
            ],
        })
        .mount(&server)
        .await;

    let reply = structured(&server, 2).await.call::<Pick>(call()).await.unwrap();
    assert_eq!(reply.value.answer, "ok");
    assert_eq!(reply.retry_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_output_exhausts_budget() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(SequenceResponder {
            calls: calls.clone(),
            replies: vec![completion("not json at all")],
        })
        .mount(&server)
        .await;

    let err = structured(&server, 2)
        .await
        .call::<Pick>(call())
        .await
        .unwrap_err();
    assert!(matches!(err, StructuredError::Validation { .. }));
    assert_eq!(err.attempts(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rejected_credentials_are_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "bad key" }
        })))
        .mount(&server)
        .await;

    let err = structured(&server, 3)
        .await
        .call::<Pick>(call())
        .await
        .unwrap_err();
    assert!(matches!(err, StructuredError::Provider { attempts: 1, .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
