use futures_util::StreamExt;
use hnbrief::error::LlmError;
use hnbrief::llm::remote::RemoteLlmProvider;
use hnbrief::llm::{ChatMessage, LlmProvider, LlmRequest, StreamEvent};
use mockito::Matcher;

fn request() -> LlmRequest {
    LlmRequest {
        messages: vec![
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("Summarize this"),
        ],
        max_tokens: Some(100),
        temperature: Some(0.7),
        timeout_seconds: Some(10),
    }
}

#[tokio::test]
async fn test_remote_provider_with_mock() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .match_header("authorization", "Bearer fake-api-key")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "model": "qwen-turbo",
            "messages": [
                {"role": "system", "content": "You are a helpful assistant."},
                {"role": "user", "content": "Summarize this"}
            ],
            "max_tokens": 100
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "model": "qwen-turbo",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "This is a test response"
                    },
                    "finish_reason": "stop"
                }],
                "usage": {
                    "prompt_tokens": 10,
                    "completion_tokens": 5,
                    "total_tokens": 15
                }
            }"#,
        )
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "qwen-turbo");
    let response = provider.generate(request()).await.unwrap();

    assert_eq!(response.content, "This is a test response");
    assert_eq!(response.usage.prompt_tokens, 10);
    assert_eq!(response.usage.completion_tokens, 5);
    assert_eq!(response.usage.total_tokens, 15);
    assert_eq!(response.model, "qwen-turbo");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_empty_choices() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"model": "qwen-turbo", "choices": []}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "qwen-turbo");
    let result = provider.generate(request()).await;
    assert!(matches!(result, Err(LlmError::EmptyChoices)));
}

#[tokio::test]
async fn test_remote_provider_error_handling() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(429)
        .with_body("Rate limit exceeded")
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "qwen-turbo");
    let result = provider.generate(request()).await;

    match result {
        Err(LlmError::Api { status, body }) => {
            assert_eq!(status, 429);
            assert!(body.contains("Rate limit"));
        }
        other => panic!("expected API error, got {:?}", other.map(|r| r.content)),
    }

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_streams_deltas() {
    let mut server = mockito::Server::new_async().await;

    let body = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    let mock = server
        .mock("POST", "/")
        .match_body(Matcher::PartialJson(serde_json::json!({ "stream": true })))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "qwen-turbo");
    let events: Vec<StreamEvent> = provider
        .generate_stream(request())
        .await
        .unwrap()
        .map(|e| e.unwrap())
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("Hel".into()),
            StreamEvent::Delta("lo".into()),
            StreamEvent::Finished,
        ]
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_stream_rejected_before_output() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .with_status(401)
        .with_body(r#"{"error": "invalid api key"}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "bad-key", "qwen-turbo");
    let result = provider.generate_stream(request()).await;
    assert!(matches!(result, Err(LlmError::Api { status: 401, .. })));
}
