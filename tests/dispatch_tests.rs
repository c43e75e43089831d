use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_test::assert_ok;
use wiremock::matchers::{
  any, body_partial_json, header, method, path, query_param
};
use wiremock::{Mock, MockServer, ResponseTemplate};

use notdiamond::{ClientConfig, Dispatcher, Error, Message, NotDiamond, Provider};
use notdiamond::client::CreateRequest;
use notdiamond::config::EmptyRankingPolicy;
use notdiamond::dispatch::{conversation_for, InvokeRequest, ADAPTERS};
use notdiamond::normalize::{collect_text, ReplyStream};
use notdiamond::providers::{BackendRequest, ChatBackend};
use notdiamond::request::{ProviderDescriptor, ResponseSchema, SelectOptions, ToolSpec};
use notdiamond::transport::MODEL_SELECT_PATH;

fn init_logging()
{   let _ = env_logger::builder().is_test(true).try_init();
}

/// Config with every back end pointed at the mock server
fn config_for(server: &MockServer) -> ClientConfig
{   let mut config = ClientConfig::new("test-key").with_base_url(server.uri());
    for provider in Provider::ALL
    {   config = config.with_provider_base_url(provider, server.uri());
    }
    config
}

fn dispatcher_for(config: ClientConfig) -> Dispatcher
{   Dispatcher::new(Arc::new(config), reqwest::Client::new())
}

fn sse(events: &[Value]) -> String
{   let mut body: String = events
      .iter()
      .map(|e| format!("data: {}\n\n", e))
      .collect();
    body.push_str("data: [DONE]\n\n");
    body
}

fn answer_schema() -> ResponseSchema
{   ResponseSchema::new(
      "answer",
      json!({
        "type": "object",
        "properties": { "value": { "type": "integer" } },
        "required": ["value"]
      })
    )
}

fn add_tool() -> ToolSpec
{   ToolSpec::function(
      "add",
      Some("Adds two numbers".to_string()),
      json!({
        "type": "object",
        "properties": { "a": { "type": "number" }, "b": { "type": "number" } }
      })
    )
}

#[test]
fn test_every_provider_has_an_adapter()
{   for provider in Provider::ALL
    {   assert!(
          ADAPTERS.iter().any(|entry| entry.provider == provider),
          "no adapter for {}",
          provider
        );
    }
}

#[tokio::test]
async fn test_unknown_provider_fails_before_network()
{   let server = MockServer::start().await;
    Mock::given(any())
      .respond_with(ResponseTemplate::new(200))
      .expect(0)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::OpenAI, "sk-test")
    );
    let selected = ProviderDescriptor::new("unknown-llm", "gpt-4");
    let request = InvokeRequest::new(vec![Message::user("hi")]);

    let result = dispatcher.invoke(&selected, &request).await;
    assert_eq!(result, Err(Error::UnsupportedProvider("unknown-llm".to_string())));

    let streamed = dispatcher.invoke_stream(&selected, &request).await;
    assert!(matches!(streamed, Err(Error::UnsupportedProvider(_))));
}

#[tokio::test]
async fn test_missing_credential_fails_before_network()
{   let server = MockServer::start().await;
    Mock::given(any())
      .respond_with(ResponseTemplate::new(200))
      .expect(0)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(config_for(&server));
    let selected = ProviderDescriptor::new("mistral", "mistral-large-latest");
    let request = InvokeRequest::new(vec![Message::user("hi")]);

    let result = dispatcher.invoke(&selected, &request).await;
    assert_eq!(result, Err(Error::MissingCredential("mistral".to_string())));
}

#[test]
fn test_per_call_credential_wins()
{   let dispatcher = dispatcher_for(
      ClientConfig::new("test-key").with_provider_key(Provider::OpenAI, "default")
    );
    let per_call = InvokeRequest::default()
      .with_credential(Provider::OpenAI, "per-call")
      .credentials;

    assert_eq!(
      dispatcher.credential(Provider::OpenAI, &per_call),
      Ok("per-call".to_string())
    );
    assert_eq!(
      dispatcher.credential(Provider::OpenAI, &Default::default()),
      Ok("default".to_string())
    );
    assert!(dispatcher.credential(Provider::Google, &per_call).is_err());
}

#[tokio::test]
async fn test_openai_invoke_with_system_prompt()
{   init_logging();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .and(header("authorization", "Bearer sk-test"))
      .and(body_partial_json(json!({
        "model": "gpt-4o",
        "messages": [
          { "role": "system", "content": "You are terse." },
          { "role": "user", "content": "What is 12x12?" }
        ]
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
          "message": { "role": "assistant", "content": "144" },
          "finish_reason": "stop"
        }]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(config_for(&server));
    let candidates = vec![
      ProviderDescriptor::new("openai", "gpt-4o")
        .with_system_prompt("You are terse.")
    , ProviderDescriptor::new("anthropic", "claude-3-opus-20240229")
    ];
    let request = InvokeRequest::new(vec![Message::user("What is 12x12?")])
      .with_candidates(candidates)
      .with_credential(Provider::OpenAI, "sk-test");

    let selected = ProviderDescriptor::new("openai", "gpt-4o");
    let text = assert_ok!(dispatcher.invoke(&selected, &request).await);
    assert_eq!(text, "144");
}

#[test]
fn test_system_prompt_precedes_existing_system_message()
{   let request = InvokeRequest::new(vec![
        Message::system("Be helpful.")
      , Message::user("hi")
      ])
      .with_candidates(vec![
        ProviderDescriptor::new("google", "gemini-pro")
          .with_system_prompt("Speak like a pirate.")
      ]);

    let selected = ProviderDescriptor::new("google", "gemini-pro");
    let messages = conversation_for(&selected, &request);
    assert_eq!(
      messages,
      vec![
        Message::system("Speak like a pirate.")
      , Message::system("Be helpful.")
      , Message::user("hi")
      ]
    );

    let other = ProviderDescriptor::new("google", "gemini-1.5-pro-latest");
    assert_eq!(conversation_for(&other, &request).len(), 2);
}

#[tokio::test]
async fn test_openai_stream_yields_chunks_in_order()
{   let server = MockServer::start().await;

    let body = sse(&[
      json!({ "choices": [{ "delta": { "role": "assistant", "content": "" } }] })
    , json!({ "choices": [{ "delta": { "content": "a" } }] })
    , json!({ "choices": [{ "delta": { "content": "b" } }] })
    , json!({ "choices": [{ "delta": { "content": "c" } }] })
    , json!({ "choices": [{ "delta": {}, "finish_reason": "stop" }] })
    ]);
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .and(body_partial_json(json!({ "stream": true })))
      .respond_with(
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
      )
      .expect(1)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::OpenAI, "sk-test")
    );
    let selected = ProviderDescriptor::new("openai", "gpt-4o-mini");
    let request = InvokeRequest::new(vec![Message::user("abc?")]);

    let mut stream = assert_ok!(dispatcher.invoke_stream(&selected, &request).await);
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await
    {   chunks.push(assert_ok!(chunk));
    }
    assert_eq!(chunks, vec!["a", "b", "c"]);
    assert_eq!(chunks.concat(), "abc");
}

fn openai_json_reply(content: &str) -> ResponseTemplate
{   ResponseTemplate::new(200).set_body_json(json!({
      "choices": [{
        "message": { "role": "assistant", "content": content },
        "finish_reason": "stop"
      }]
    }))
}

#[tokio::test]
async fn test_openai_structured_output_leaves_strict_unset()
{   let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .and(body_partial_json(json!({
        "response_format": {
          "type": "json_schema",
          "json_schema": { "name": "answer", "schema": answer_schema().schema }
        }
      })))
      .respond_with(openai_json_reply("{\"value\":144}"))
      .expect(1)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::OpenAI, "sk-test")
    );
    let request = InvokeRequest::new(vec![Message::user("12x12")])
      .with_response_schema(answer_schema());
    let selected = ProviderDescriptor::new("openai", "gpt-4o");

    let text = assert_ok!(dispatcher.invoke(&selected, &request).await);
    assert_eq!(text, r#"{"value":144}"#);

    let requests = server.received_requests().await.expect("recording");
    let body: Value = requests[0].body_json().expect("json body");
    let json_schema = body["response_format"]["json_schema"]
      .as_object()
      .expect("json_schema object");
    assert!(!json_schema.contains_key("strict"));
}

#[tokio::test]
async fn test_openai_strict_schema_is_opt_in()
{   let server = MockServer::start().await;

    let strict_schema = ResponseSchema::new(
        "answer",
        json!({
          "type": "object",
          "properties": { "value": { "type": "integer" } },
          "required": ["value"],
          "additionalProperties": false
        })
      )
      .with_strict(true);

    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .and(body_partial_json(json!({
        "response_format": {
          "type": "json_schema",
          "json_schema": {
            "name": "answer",
            "strict": true,
            "schema": { "additionalProperties": false }
          }
        }
      })))
      .respond_with(openai_json_reply("{\"value\":144}"))
      .expect(1)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::OpenAI, "sk-test")
    );
    let request = InvokeRequest::new(vec![Message::user("12x12")])
      .with_response_schema(strict_schema);
    let selected = ProviderDescriptor::new("openai", "gpt-4o");

    let text = assert_ok!(dispatcher.invoke(&selected, &request).await);
    assert_eq!(text, r#"{"value":144}"#);
}

#[tokio::test]
async fn test_openai_tool_call_reply_becomes_content()
{   let server = MockServer::start().await;

    let tool_calls = json!([{
      "id": "call_1",
      "type": "function",
      "function": { "name": "add", "arguments": "{\"a\":1,\"b\":2}" }
    }]);
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .and(body_partial_json(json!({
        "tools": [{ "type": "function", "function": { "name": "add" } }]
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
          "message": {
            "role": "assistant",
            "content": null,
            "tool_calls": tool_calls
          },
          "finish_reason": "tool_calls"
        }]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::OpenAI, "sk-test")
    );
    let request = InvokeRequest::new(vec![Message::user("1+2")])
      .with_tools(vec![add_tool()]);
    let selected = ProviderDescriptor::new("openai", "gpt-4o");

    let text = assert_ok!(dispatcher.invoke(&selected, &request).await);
    assert_eq!(serde_json::from_str::<Value>(&text).expect("json"), tool_calls);
}

#[tokio::test]
async fn test_openai_stream_carries_tool_arguments_and_errors()
{   let server = MockServer::start().await;

    let body = sse(&[
      json!({ "choices": [{ "delta": { "tool_calls": [{
        "index": 0, "id": "call_1", "type": "function",
        "function": { "name": "add", "arguments": "" }
      }] } }] })
    , json!({ "choices": [{ "delta": { "tool_calls": [{
        "index": 0, "function": { "arguments": "{\"a\":1," }
      }] } }] })
    , json!({ "choices": [{ "delta": { "tool_calls": [{
        "index": 0, "function": { "arguments": "\"b\":2}" }
      }] } }] })
    , json!({ "error": { "message": "overloaded", "type": "server_error" } })
    ]);
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .respond_with(
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
      )
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::OpenAI, "sk-test")
    );
    let request = InvokeRequest::new(vec![Message::user("1+2")])
      .with_tools(vec![add_tool()]);
    let selected = ProviderDescriptor::new("openai", "gpt-4o");

    let mut stream = assert_ok!(dispatcher.invoke_stream(&selected, &request).await);
    assert_eq!(stream.next().await, Some(Ok("{\"a\":1,".to_string())));
    assert_eq!(stream.next().await, Some(Ok("\"b\":2}".to_string())));
    assert_eq!(
      stream.next().await,
      Some(Err(Error::Api
      {   provider: "openai".to_string()
        , message: "overloaded".to_string()
      }))
    );
}

#[tokio::test]
async fn test_backend_error_status_is_raised()
{   let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::Together, "tg-test")
    );
    let selected = ProviderDescriptor::new("together", "Llama-3-70b-chat-hf");
    let request = InvokeRequest::new(vec![Message::user("hi")]);

    match dispatcher.invoke(&selected, &request).await
    {   Err(Error::Api { provider, message }) => {
          assert_eq!(provider, "together");
          assert!(message.contains("429"));
          assert!(message.contains("rate limited"));
        }
      , other => panic!("expected API error, got {:?}", other)
    }
}

#[tokio::test]
async fn test_anthropic_lifts_system_and_uses_api_key_header()
{   let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/messages"))
      .and(header("x-api-key", "ak-test"))
      .and(header("anthropic-version", "2023-06-01"))
      .and(body_partial_json(json!({
        "model": "claude-3-haiku-20240307",
        "system": "Be brief.",
        "messages": [{ "role": "user", "content": "hi" }]
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "content": [{ "type": "text", "text": "hello" }],
        "stop_reason": "end_turn"
      })))
      .expect(1)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::Anthropic, "ak-test")
    );
    let request = InvokeRequest::new(vec![
      Message::system("Be brief.")
    , Message::user("hi")
    ]);
    let selected = ProviderDescriptor::new("anthropic", "claude-3-haiku-20240307");

    let text = assert_ok!(dispatcher.invoke(&selected, &request).await);
    assert_eq!(text, "hello");
}

#[tokio::test]
async fn test_anthropic_structured_output_uses_forced_tool()
{   let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/messages"))
      .and(body_partial_json(json!({
        "tool_choice": { "type": "tool", "name": "answer" }
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "content": [{
          "type": "tool_use",
          "id": "toolu_1",
          "name": "answer",
          "input": { "value": 144 }
        }],
        "stop_reason": "tool_use"
      })))
      .expect(1)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::Anthropic, "ak-test")
    );
    let request = InvokeRequest::new(vec![Message::user("12x12")])
      .with_response_schema(answer_schema());
    let selected = ProviderDescriptor::new("anthropic", "claude-3-5-sonnet-20240620");

    let text = assert_ok!(dispatcher.invoke(&selected, &request).await);
    assert_eq!(text, r#"{"value":144}"#);
}

#[tokio::test]
async fn test_anthropic_stream()
{   let server = MockServer::start().await;

    let body = [
      json!({ "type": "message_start", "message": {} })
    , json!({ "type": "content_block_delta", "index": 0,
              "delta": { "type": "text_delta", "text": "Hel" } })
    , json!({ "type": "content_block_delta", "index": 0,
              "delta": { "type": "text_delta", "text": "lo" } })
    , json!({ "type": "message_stop" })
    ]
      .iter()
      .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap(), e))
      .collect::<String>();

    Mock::given(method("POST"))
      .and(path("/messages"))
      .respond_with(
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
      )
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::Anthropic, "ak-test")
    );
    let request = InvokeRequest::new(vec![Message::user("hi")]);
    let selected = ProviderDescriptor::new("anthropic", "claude-2.1");

    let stream = assert_ok!(dispatcher.invoke_stream(&selected, &request).await);
    assert_eq!(collect_text(stream).await, Ok("Hello".to_string()));
}

#[tokio::test]
async fn test_google_generate_content()
{   let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/models/gemini-1.5-flash-latest:generateContent"))
      .and(header("x-goog-api-key", "g-test"))
      .and(body_partial_json(json!({
        "systemInstruction": { "parts": [{ "text": "Be brief." }] },
        "contents": [
          { "role": "user", "parts": [{ "text": "hi" }] },
          { "role": "model", "parts": [{ "text": "hello" }] },
          { "role": "user", "parts": [{ "text": "again" }] }
        ]
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "candidates": [{
          "content": { "role": "model", "parts": [{ "text": "hi again" }] }
        }]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::Google, "g-test")
    );
    let request = InvokeRequest::new(vec![
      Message::system("Be brief.")
    , Message::user("hi")
    , Message::assistant("hello")
    , Message::user("again")
    ]);
    let selected = ProviderDescriptor::new("google", "gemini-1.5-flash-latest");

    let text = assert_ok!(dispatcher.invoke(&selected, &request).await);
    assert_eq!(text, "hi again");
}

#[tokio::test]
async fn test_anthropic_forwards_tools_as_input_schema()
{   let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/messages"))
      .and(body_partial_json(json!({
        "tools": [{
          "name": "add",
          "description": "Adds two numbers",
          "input_schema": add_tool().function.parameters
        }]
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "content": [{
          "type": "tool_use",
          "id": "toolu_1",
          "name": "add",
          "input": { "a": 1, "b": 2 }
        }],
        "stop_reason": "tool_use"
      })))
      .expect(1)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::Anthropic, "ak-test")
    );
    let request = InvokeRequest::new(vec![Message::user("1+2")])
      .with_tools(vec![add_tool()]);
    let selected = ProviderDescriptor::new("anthropic", "claude-3-5-sonnet-20240620");

    let text = assert_ok!(dispatcher.invoke(&selected, &request).await);
    let blocks: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(blocks[0]["name"], json!("add"));
    assert_eq!(blocks[0]["input"], json!({ "a": 1, "b": 2 }));

    let requests = server.received_requests().await.expect("recording");
    let body: Value = requests[0].body_json().expect("json body");
    assert!(body.get("tool_choice").is_none());
}

#[tokio::test]
async fn test_google_forwards_function_declarations()
{   let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/models/gemini-1.5-pro-latest:generateContent"))
      .and(body_partial_json(json!({
        "tools": [{
          "functionDeclarations": [{
            "name": "add",
            "description": "Adds two numbers",
            "parameters": add_tool().function.parameters
          }]
        }]
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "candidates": [{
          "content": {
            "role": "model",
            "parts": [{ "functionCall": { "name": "add", "args": { "a": 1, "b": 2 } } }]
          }
        }]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::Google, "g-test")
    );
    let request = InvokeRequest::new(vec![Message::user("1+2")])
      .with_tools(vec![add_tool()]);
    let selected = ProviderDescriptor::new("google", "gemini-1.5-pro-latest");

    let text = assert_ok!(dispatcher.invoke(&selected, &request).await);
    assert_eq!(
      serde_json::from_str::<Value>(&text).expect("json"),
      json!([{ "name": "add", "args": { "a": 1, "b": 2 } }])
    );
}

#[tokio::test]
async fn test_google_structured_output_sets_response_schema()
{   let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/models/gemini-1.5-flash-latest:generateContent"))
      .and(body_partial_json(json!({
        "generationConfig": {
          "responseMimeType": "application/json",
          "responseSchema": answer_schema().schema
        }
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "candidates": [{
          "content": { "role": "model", "parts": [{ "text": "{\"value\":144}" }] }
        }]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::Google, "g-test")
    );
    let request = InvokeRequest::new(vec![Message::user("12x12")])
      .with_response_schema(answer_schema());
    let selected = ProviderDescriptor::new("google", "gemini-1.5-flash-latest");

    let text = assert_ok!(dispatcher.invoke(&selected, &request).await);
    assert_eq!(text, r#"{"value":144}"#);
}

fn gemini_chunk(text: &str) -> Value
{   json!({
      "candidates": [{
        "content": { "role": "model", "parts": [{ "text": text }] }
      }]
    })
}

#[tokio::test]
async fn test_google_stream()
{   let server = MockServer::start().await;

    let body: String = [gemini_chunk("Hel"), gemini_chunk("lo")]
      .iter()
      .map(|e| format!("data: {}\r\n\r\n", e))
      .collect();
    Mock::given(method("POST"))
      .and(path("/models/gemini-1.5-flash-latest:streamGenerateContent"))
      .and(query_param("alt", "sse"))
      .and(header("x-goog-api-key", "g-test"))
      .respond_with(
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
      )
      .expect(1)
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::Google, "g-test")
    );
    let request = InvokeRequest::new(vec![Message::user("hi")]);
    let selected = ProviderDescriptor::new("google", "gemini-1.5-flash-latest");

    let stream = assert_ok!(dispatcher.invoke_stream(&selected, &request).await);
    assert_eq!(collect_text(stream).await, Ok("Hello".to_string()));
}

#[tokio::test]
async fn test_google_stream_error_event_is_raised()
{   let server = MockServer::start().await;

    let body = sse(&[
      gemini_chunk("partial")
    , json!({ "error": { "code": 503, "message": "model overloaded" } })
    ]);
    Mock::given(method("POST"))
      .and(path("/models/gemini-pro:streamGenerateContent"))
      .respond_with(
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
      )
      .mount(&server)
      .await;

    let dispatcher = dispatcher_for(
      config_for(&server).with_provider_key(Provider::Google, "g-test")
    );
    let request = InvokeRequest::new(vec![Message::user("hi")]);
    let selected = ProviderDescriptor::new("google", "gemini-pro");

    let mut stream = assert_ok!(dispatcher.invoke_stream(&selected, &request).await);
    assert_eq!(stream.next().await, Some(Ok("partial".to_string())));
    assert_eq!(
      stream.next().await,
      Some(Err(Error::Api
      {   provider: "google".to_string()
        , message: "model overloaded".to_string()
      }))
    );
}

/// Back end that records whether it was handed a schema
struct RecordingBackend
{   structured: bool
  , saw_schema: Mutex<Option<bool>>
}

#[async_trait]
impl ChatBackend for RecordingBackend
{   fn provider(&self) -> Provider
    {   Provider::Perplexity
    }

    fn supports_structured_output(&self) -> bool
    {   self.structured
    }

    async fn complete(
      &self
    , request: &BackendRequest<'_>
    ) -> notdiamond::error::Result<Value>
    {   *self.saw_schema.lock().unwrap() = Some(request.schema.is_some());
        Ok(json!({ "content": "ok" }))
    }

    async fn stream(
      &self
    , _request: &BackendRequest<'_>
    ) -> notdiamond::error::Result<ReplyStream>
    {   let chunks: Vec<Result<Value, Error>> = ["a", "b", "c"]
          .into_iter()
          .map(|c| Ok(json!({ "content": c })))
          .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[tokio::test]
async fn test_schema_only_reaches_capable_backends()
{   let dispatcher = dispatcher_for(ClientConfig::new("test-key"));
    let selected = ProviderDescriptor::new(
      "perplexity",
      "llama-3.1-sonar-large-128k-online"
    );
    let request = InvokeRequest::new(vec![Message::user("hi")])
      .with_response_schema(answer_schema());

    for structured in [false, true]
    {   let backend = RecordingBackend
        {   structured
          , saw_schema: Mutex::new(None)
        };
        let text = assert_ok!(
          dispatcher.invoke_with(&backend, &selected, &request).await
        );
        assert_eq!(text, "ok");
        assert_eq!(*backend.saw_schema.lock().unwrap(), Some(structured));
    }
}

#[tokio::test]
async fn test_custom_backend_stream_concatenates()
{   let dispatcher = dispatcher_for(ClientConfig::new("test-key"));
    let backend = RecordingBackend
    {   structured: false
      , saw_schema: Mutex::new(None)
    };
    let selected = ProviderDescriptor::new(
      "perplexity",
      "llama-3.1-sonar-large-128k-online"
    );
    let request = InvokeRequest::new(vec![Message::user("hi")]);

    let stream = assert_ok!(
      dispatcher.invoke_stream_with(&backend, &selected, &request).await
    );
    assert_eq!(collect_text(stream).await, Ok("abc".to_string()));
}

#[tokio::test]
async fn test_create_selects_then_dispatches()
{   init_logging();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path(MODEL_SELECT_PATH))
      .and(header("authorization", "Bearer test-key"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "providers": [
          { "provider": "openai", "model": "gpt-4o" },
          { "provider": "anthropic", "model": "claude-3-opus-20240229" }
        ],
        "session_id": "s-create"
      })))
      .expect(1)
      .mount(&server)
      .await;

    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .and(header("authorization", "Bearer sk-test"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
          "message": { "role": "assistant", "content": "144" },
          "finish_reason": "stop"
        }]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let client = NotDiamond::new(config_for(&server)).expect("client");
    let request = CreateRequest::new(
        vec![Message::user("What is 12x12?")]
      , vec![
          ProviderDescriptor::new("openai", "gpt-4o")
        , ProviderDescriptor::new("anthropic", "claude-3-opus-20240229")
        ]
      )
      .with_credential(Provider::OpenAI, "sk-test");

    let response = assert_ok!(client.create(request).await);
    assert_eq!(response.content, "144");
    assert_eq!(response.session_id, "s-create");
    assert_eq!(response.provider, ProviderDescriptor::new("openai", "gpt-4o"));
}

#[tokio::test]
async fn test_create_surfaces_remote_error()
{   let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path(MODEL_SELECT_PATH))
      .respond_with(
        ResponseTemplate::new(401).set_body_json(json!({ "detail": "bad key" }))
      )
      .mount(&server)
      .await;

    let client = NotDiamond::new(config_for(&server)).expect("client");
    let request = CreateRequest::new(
      vec![Message::user("hi")]
    , vec![ProviderDescriptor::new("openai", "gpt-4o")]
    );

    let result = client.create(request).await;
    assert_eq!(result, Err(Error::Remote("bad key".to_string())));
}

#[tokio::test]
async fn test_empty_ranking_policy()
{   let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path(MODEL_SELECT_PATH))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "providers": [],
        "session_id": "s-empty"
      })))
      .mount(&server)
      .await;

    let body = sse(&[json!({ "choices": [{ "delta": { "content": "fallback" } }] })]);
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .respond_with(
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
      )
      .expect(1)
      .mount(&server)
      .await;

    let request = CreateRequest::new(
        vec![Message::user("hi")]
      , vec![ProviderDescriptor::new("openai", "gpt-4o")]
      )
      .with_options(SelectOptions::default().with_max_model_depth(1))
      .with_credential(Provider::OpenAI, "sk-test");

    let strict = NotDiamond::new(config_for(&server)).expect("client");
    let result = strict.create_stream(request.clone()).await;
    assert!(matches!(result, Err(Error::Remote(_))));

    let fallback = ProviderDescriptor::new("openai", "gpt-4o-mini");
    let lenient = NotDiamond::new(
      config_for(&server)
        .with_empty_ranking(EmptyRankingPolicy::UseProvider(fallback.clone()))
    ).expect("client");
    let created = assert_ok!(lenient.create_stream(request).await);
    assert_eq!(created.provider, fallback);
    assert_eq!(created.session_id, "s-empty");
    assert_eq!(collect_text(created.stream).await, Ok("fallback".to_string()));
}
