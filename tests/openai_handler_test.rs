use llm_gateway::{
    LlmProvider, OpenAICompatibleHandler, QueryOptions, Role, UsageEmitter, UsageSource,
};
use mockito::Matcher;
use serde_json::json;
use std::sync::{Arc, Mutex};

fn chat_response(content: &str) -> String {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
    })
    .to_string()
}

fn tool_call_response(name: &str, arguments: &str) -> String {
    json!({
        "id": "chatcmpl-tool",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": name, "arguments": arguments}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
    })
    .to_string()
}

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Collects `(segment, is_complete)` pairs delivered to a stream callback.
fn collecting_callback() -> (
    llm_gateway::SegmentCallback,
    Arc<Mutex<Vec<(String, bool)>>>,
) {
    let collected: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    let callback: llm_gateway::SegmentCallback = Box::new(move |segment, is_complete| {
        sink.lock().unwrap().push((segment.to_string(), is_complete));
        Ok(())
    });
    (callback, collected)
}

#[tokio::test]
async fn simple_query_appends_history_and_usage() {
    trace_init();
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_response("4"))
        .create_async()
        .await;

    let (emitter, mut events) = UsageEmitter::channel();
    let handler =
        OpenAICompatibleHandler::new("test-key", server.url(), "You are helpful", Some(emitter));

    let answer = handler.query("2+2?", "gpt-4o").await.unwrap();
    assert_eq!(answer, "4");

    let messages = handler.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(messages[0].content, "You are helpful");
    assert_eq!(messages[1].role, Role::User);
    assert_eq!(messages[1].content, "2+2?");
    assert_eq!(messages[2].role, Role::Assistant);
    assert_eq!(messages[2].content, "4");

    let usage = handler.last_usage().unwrap();
    assert_eq!(usage.source, UsageSource::Provider);
    assert_eq!(
        usage.total_tokens,
        usage.prompt_tokens + usage.completion_tokens
    );

    let event = events.recv().await.unwrap();
    assert_eq!(event.prompt, "2+2?");
    assert_eq!(event.response, "4");
    assert_eq!(event.info.usage.total_tokens, 10);
    assert!(!event.info.has_tool_calls);

    mock.assert_async().await;
}

#[tokio::test]
async fn tool_loop_resolves_and_reports_calls() {
    let mut server = mockito::Server::new_async().await;
    // First round: the model asks for a tool. The later, more specific mock
    // (matched on the tool result being present) wins for the second round.
    let first = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(tool_call_response("get_weather", "{\"city\":\"Paris\"}"))
        .create_async()
        .await;
    let second = server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::Regex("tool_call_id".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_response("It's 22C in Paris"))
        .create_async()
        .await;

    let (emitter, mut events) = UsageEmitter::channel();
    let handler =
        OpenAICompatibleHandler::new("test-key", server.url(), "You are helpful", Some(emitter));
    handler.register_function_tool(
        "get_weather",
        "current weather for a city",
        json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        Arc::new(|args| {
            assert_eq!(args.get("city").and_then(|v| v.as_str()), Some("Paris"));
            Ok("22C".to_string())
        }),
    );

    let answer = handler
        .query("What's the weather in Paris?", "gpt-4o")
        .await
        .unwrap();
    assert_eq!(answer, "It's 22C in Paris");

    // history: system, user, assistant(tool_calls), tool, assistant(final)
    let messages = handler.messages();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[2].tool_calls.len(), 1);
    assert_eq!(messages[3].role, Role::Tool);
    assert_eq!(messages[3].content, "22C");
    assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_1"));

    let event = events.recv().await.unwrap();
    assert!(event.info.has_tool_calls);
    assert_eq!(event.info.tool_call_count, 1);
    assert_eq!(event.info.tool_calls[0].name, "get_weather");
    // usage accumulated across both rounds
    assert_eq!(event.info.usage.total_tokens, 17);

    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn failing_tool_becomes_an_error_message_not_a_failure() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(tool_call_response("broken_tool", "{}"))
        .create_async()
        .await;
    server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::Regex("tool_call_id".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_response("recovered anyway"))
        .create_async()
        .await;

    let handler = OpenAICompatibleHandler::new("test-key", server.url(), "sys", None);
    handler.register_function_tool(
        "broken_tool",
        "always fails",
        json!({"type": "object"}),
        Arc::new(|_| Err(anyhow::anyhow!("backend down"))),
    );

    let answer = handler.query("do it", "gpt-4o").await.unwrap();
    assert_eq!(answer, "recovered anyway");

    let messages = handler.messages();
    let tool_msg = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.content.starts_with("Error:"));
    assert!(tool_msg.content.contains("backend down"));
}

#[tokio::test]
async fn unknown_tool_call_is_recovered_too() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(tool_call_response("never_registered", "{}"))
        .create_async()
        .await;
    server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::Regex("tool_call_id".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_response("done"))
        .create_async()
        .await;

    let handler = OpenAICompatibleHandler::new("test-key", server.url(), "sys", None);
    let answer = handler.query("go", "gpt-4o").await.unwrap();
    assert_eq!(answer, "done");

    let messages = handler.messages();
    let tool_msg = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.content.contains("unknown function tool"));
}

#[tokio::test]
async fn echoed_response_is_rejected() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_response("repeat after me"))
        .create_async()
        .await;

    let handler = OpenAICompatibleHandler::new("test-key", server.url(), "sys", None);
    let err = handler.query("repeat after me", "gpt-4o").await.unwrap_err();
    assert!(matches!(
        err,
        llm_gateway::GatewayError::EmptyOrEcho { .. }
    ));
}

#[tokio::test]
async fn empty_response_is_rejected() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_response(""))
        .create_async()
        .await;

    let handler = OpenAICompatibleHandler::new("test-key", server.url(), "sys", None);
    let err = handler.query("hello", "gpt-4o").await.unwrap_err();
    assert!(matches!(
        err,
        llm_gateway::GatewayError::EmptyOrEcho { .. }
    ));
}

#[tokio::test]
async fn upstream_http_error_is_surfaced() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body("{\"error\": \"invalid api key\"}")
        .create_async()
        .await;

    let handler = OpenAICompatibleHandler::new("bad-key", server.url(), "sys", None);
    let err = handler.query("hello", "gpt-4o").await.unwrap_err();
    assert!(err.is_client_error());
    match err {
        llm_gateway::GatewayError::Api { status, message } => {
            assert_eq!(status, 401);
            assert!(message.contains("invalid api key"));
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn runaway_tool_loop_hits_the_iteration_cap() {
    let mut server = mockito::Server::new_async().await;
    // Upstream never stops asking for tools.
    let mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(tool_call_response("get_weather", "{\"city\":\"Paris\"}"))
        .expect_at_least(10)
        .create_async()
        .await;

    let handler = OpenAICompatibleHandler::new("test-key", server.url(), "sys", None);
    handler.register_function_tool(
        "get_weather",
        "",
        json!({"type": "object"}),
        Arc::new(|_| Ok("22C".to_string())),
    );

    let err = handler.query("weather?", "gpt-4o").await.unwrap_err();
    assert!(matches!(
        err,
        llm_gateway::GatewayError::MaxIterations { limit: 10 }
    ));
    mock.assert_async().await;

    // The handler stays usable: history carries no dangling tool round.
    let messages = handler.messages();
    for (i, msg) in messages.iter().enumerate() {
        for call in &msg.tool_calls {
            assert!(
                messages[i + 1..].iter().any(|m| {
                    m.role == Role::Tool && m.tool_call_id.as_deref() == Some(call.id.as_str())
                }),
                "dangling tool call left in history"
            );
        }
    }
}

#[tokio::test]
async fn streamed_segments_concatenate_to_the_full_response() {
    let sse_body = concat!(
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"It's \"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"22C in \"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Paris. Enjoy\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":5,\"total_tokens\":12}}\n\n",
        "data: [DONE]\n\n",
    );

    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::Regex("\"stream\":true".to_string()))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse_body)
        .create_async()
        .await;

    let (emitter, mut events) = UsageEmitter::channel();
    let handler =
        OpenAICompatibleHandler::new("test-key", server.url(), "You are helpful", Some(emitter));

    let (callback, collected) = collecting_callback();
    let mut options = QueryOptions::for_model("gpt-4o");
    options.stream = true;
    let full = handler.query_stream("weather?", options, callback).await.unwrap();
    assert_eq!(full, "It's 22C in Paris. Enjoy");

    let segments = collected.lock().unwrap().clone();
    // punctuation-bounded chunks, then the unflushed tail, then completion
    let (final_segment, body_segments) = segments.split_last().unwrap();
    assert_eq!(final_segment, &(String::new(), true));
    let rebuilt: String = body_segments.iter().map(|(s, _)| s.as_str()).collect();
    assert_eq!(rebuilt, full);
    assert!(body_segments.iter().all(|(_, complete)| !complete));
    // first flush ends at the sentence boundary, tail follows unchunked
    assert_eq!(body_segments[0].0, "It's 22C in Paris. ");

    let usage = handler.last_usage().unwrap();
    assert_eq!(usage.total_tokens, 12);
    assert_eq!(usage.source, UsageSource::Provider);

    let event = events.recv().await.unwrap();
    assert_eq!(event.response, "It's 22C in Paris. Enjoy");

    // history mirrors the non-streaming path
    let messages = handler.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[2].content, "It's 22C in Paris. Enjoy");
}

#[tokio::test]
async fn streamed_tool_calls_are_reassembled_and_resolved() {
    let sse_body = concat!(
        "data: {\"id\":\"c2\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"\"}}]},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"city\\\":\"}}]},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"Paris\\\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::Regex("\"stream\":true".to_string()))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse_body)
        .create_async()
        .await;
    server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::Regex("tool_call_id".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_response("It's 22C in Paris"))
        .create_async()
        .await;

    let (emitter, mut events) = UsageEmitter::channel();
    let handler = OpenAICompatibleHandler::new("test-key", server.url(), "sys", Some(emitter));
    handler.register_function_tool(
        "get_weather",
        "",
        json!({"type": "object"}),
        Arc::new(|args| {
            assert_eq!(args.get("city").and_then(|v| v.as_str()), Some("Paris"));
            Ok("22C".to_string())
        }),
    );

    let (callback, collected) = collecting_callback();
    let mut options = QueryOptions::for_model("gpt-4o");
    options.stream = true;
    let full = handler
        .query_stream("weather in Paris?", options, callback)
        .await
        .unwrap();
    assert_eq!(full, "It's 22C in Paris");

    let segments = collected.lock().unwrap().clone();
    assert_eq!(
        segments.last().unwrap(),
        &(String::new(), true),
        "completion marker missing"
    );
    assert!(segments
        .iter()
        .any(|(s, _)| s == "It's 22C in Paris"));

    let event = events.recv().await.unwrap();
    assert!(event.info.has_tool_calls);
    assert_eq!(event.info.tool_calls[0].name, "get_weather");
    assert_eq!(
        event.info.tool_calls[0].arguments,
        "{\"city\":\"Paris\"}"
    );

    let messages = handler.messages();
    assert_eq!(messages[2].tool_calls.len(), 1);
    assert_eq!(messages[3].role, Role::Tool);
    assert_eq!(messages.last().unwrap().content, "It's 22C in Paris");
}

#[tokio::test]
async fn reset_and_system_prompt_contract() {
    let handler = OpenAICompatibleHandler::new("k", "http://localhost:1", "first prompt", None);

    handler.set_system_prompt("second prompt");
    handler.set_system_prompt("second prompt");
    assert_eq!(handler.messages().len(), 1);
    assert_eq!(handler.messages()[0].content, "second prompt");

    handler.reset_messages();
    let messages = handler.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(messages[0].content, "second prompt");
}

#[tokio::test]
async fn hangup_is_idempotent_and_final() {
    let handler = OpenAICompatibleHandler::new("k", "http://localhost:1", "sys", None);
    handler.hangup();
    handler.hangup(); // second hangup must be a no-op, not a fault

    let err = handler.query("hello", "gpt-4o").await.unwrap_err();
    assert!(matches!(err, llm_gateway::GatewayError::Hangup { .. }));
}

#[tokio::test]
async fn stale_interrupt_does_not_poison_the_next_query() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_response("4"))
        .create_async()
        .await;

    let handler = OpenAICompatibleHandler::new("test-key", server.url(), "sys", None);
    handler.interrupt(); // nothing in flight: dropped silently

    let answer = handler.query("2+2?", "gpt-4o").await.unwrap();
    assert_eq!(answer, "4");
}

#[tokio::test]
async fn duplicate_tool_registration_is_last_write_wins() {
    let handler = OpenAICompatibleHandler::new("k", "http://localhost:1", "sys", None);
    handler.register_function_tool(
        "lookup",
        "first version",
        json!({}),
        Arc::new(|_| Ok("one".to_string())),
    );
    handler.register_function_tool(
        "lookup",
        "second version",
        json!({}),
        Arc::new(|_| Ok("two".to_string())),
    );

    assert_eq!(handler.list_function_tools(), vec!["lookup".to_string()]);
    let specs = handler.function_tools();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].function.description, "second version");
}
