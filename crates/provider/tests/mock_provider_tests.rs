//! Mock Provider Tests
//!
//! Tests using mockall for the Provider trait to verify
//! that the trait can be properly mocked and used.

use async_trait::async_trait;
use mockall::mock;
use sortie_provider::{
    ChatParams, ChatResponse, Message, Provider, ProviderError, RetryError, ToolCall, Usage,
};

mock! {
    pub Provider {}

    #[async_trait]
    impl Provider for Provider {
        async fn chat(&self, params: ChatParams) -> Result<ChatResponse, ProviderError>;
        fn default_model(&self) -> String;
        fn is_configured(&self) -> bool;
    }
}

#[tokio::test]
async fn test_mock_provider_chat_returns_success() {
    let mut mock = MockProvider::new();

    mock.expect_chat()
        .times(1)
        .returning(|_| Ok(ChatResponse::text("Hello from mock!")));

    let response = mock.chat(ChatParams::default()).await.unwrap();

    assert_eq!(response.content, Some("Hello from mock!".to_string()));
    assert!(!response.has_tool_calls());
}

#[tokio::test]
async fn test_mock_provider_chat_returns_error() {
    let mut mock = MockProvider::new();

    mock.expect_chat().times(1).returning(|_| {
        Err(ProviderError::Api {
            status: 500,
            message: "Mock API error".to_string(),
        })
    });

    let result = mock.chat(ChatParams::default()).await;
    match result {
        Err(ProviderError::Api { status, message }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "Mock API error");
        }
        _ => panic!("Expected Api error"),
    }
}

#[tokio::test]
async fn test_mock_provider_chat_with_tool_calls() {
    let mut mock = MockProvider::new();

    mock.expect_chat()
        .times(1)
        .withf(|params| params.messages.len() == 1 && params.system_prompt == "sys")
        .returning(|_| {
            Ok(ChatResponse::tool_calls(
                Some("I'll help you with that".to_string()),
                vec![ToolCall::new("mock_call_1", "shellStart", r#"{"command":"ls"}"#)],
            )
            .with_usage(Usage::new(10, 5)))
        });

    let params = ChatParams {
        model: "test-model".to_string(),
        system_prompt: "sys".to_string(),
        messages: vec![Message::user("Do something")],
        ..Default::default()
    };

    let response = mock.chat(params).await.unwrap();

    assert!(response.has_tool_calls());
    assert_eq!(response.tool_calls[0].name, "shellStart");
    assert_eq!(response.usage.total(), 15);
}

#[tokio::test]
async fn test_mock_provider_retry_exhausted() {
    let mut mock = MockProvider::new();

    mock.expect_chat().times(1).returning(|_| {
        Err(ProviderError::Retry(RetryError::Status {
            status: 429,
            attempts: 3,
        }))
    });

    let result = mock.chat(ChatParams::default()).await;
    assert!(matches!(
        result,
        Err(ProviderError::Retry(RetryError::Status { status: 429, .. }))
    ));
}

#[test]
fn test_mock_provider_default_model() {
    let mut mock = MockProvider::new();

    mock.expect_default_model()
        .times(1)
        .returning(|| "mock-model-v1".to_string());

    assert_eq!(mock.default_model(), "mock-model-v1");
}

#[test]
fn test_mock_provider_is_configured() {
    let mut mock = MockProvider::new();

    mock.expect_is_configured().times(1).returning(|| true);

    assert!(mock.is_configured());
}
