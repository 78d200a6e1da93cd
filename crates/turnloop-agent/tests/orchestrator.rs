//! Integration tests for the turn orchestrator.
//!
//! A scripted transport replays canned event streams (or complete responses
//! in blocking mode) and records every request, so each test can check both
//! what the orchestrator returned and what it would have sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;

use turnloop_agent::{
    AgentError, FunctionTool, OrchestratorConfig, ResponseMode, ResponsesTransport, Result,
    ServerEventStream, ToolHandler, TurnOrchestrator, synthesize_events,
};
use turnloop_protocol::{
    ConversationItem, ErrorEvent, FunctionCallItem, Response, ResponseRequest, ResponseStatus,
    ServerEvent, ServiceError, ToolDescriptor, Usage,
};

// ═══════════════════════════════════════════════════════════════════════
//  Scripted transport
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct ScriptedTransport {
    streams: Mutex<VecDeque<Vec<ServerEvent>>>,
    responses: Mutex<VecDeque<Response>>,
    requests: Mutex<Vec<ResponseRequest>>,
}

impl ScriptedTransport {
    fn streaming(turns: Vec<Vec<ServerEvent>>) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(turns.into()),
            ..Self::default()
        })
    }

    fn blocking(responses: Vec<Response>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        })
    }

    fn requests(&self) -> Vec<ResponseRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponsesTransport for ScriptedTransport {
    async fn create_response(&self, request: &ResponseRequest) -> Result<Response> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Transport {
                reason: "no scripted response left".into(),
            })
    }

    async fn stream_response(&self, request: &ResponseRequest) -> Result<ServerEventStream> {
        self.requests.lock().unwrap().push(request.clone());
        let events = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Transport {
                reason: "no scripted stream left".into(),
            })?;
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        model: "test-model".into(),
        ..OrchestratorConfig::default()
    }
}

fn call(call_id: &str, name: &str, arguments: serde_json::Value) -> ConversationItem {
    ConversationItem::FunctionCall(FunctionCallItem {
        id: Some(format!("fc_{call_id}")),
        call_id: call_id.into(),
        name: name.into(),
        arguments: arguments.to_string(),
        status: None,
    })
}

fn response(id: &str, output: Vec<ConversationItem>) -> Response {
    Response {
        id: id.into(),
        status: Some(ResponseStatus::Completed),
        output,
        ..Response::default()
    }
}

/// The events a stream carries for `response`: created, item pairs,
/// completed.
fn streamed(response: Response) -> Vec<ServerEvent> {
    let mut events = vec![ServerEvent::ResponseCreated {
        sequence_number: None,
        response: Response {
            id: response.id.clone(),
            status: Some(ResponseStatus::InProgress),
            ..Response::default()
        },
    }];
    events.extend(synthesize_events(response));
    events
}

fn weather_tool() -> Arc<dyn ToolHandler> {
    Arc::new(FunctionTool::new(
        ToolDescriptor::function(
            "get_weather",
            "Current weather for a city",
            json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"]
            }),
        ),
        |args| async move {
            assert_eq!(args["city"], "Paris");
            Ok(json!({ "temp_c": 22 }))
        },
    ))
}

fn sleepy_tool() -> Arc<dyn ToolHandler> {
    Arc::new(FunctionTool::new(
        ToolDescriptor::function("sleepy", "Sleeps", json!({ "type": "object" })),
        |args| async move {
            let ms = args["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(format!("slept {ms}")))
        },
    ))
}

fn failing_tool() -> Arc<dyn ToolHandler> {
    Arc::new(FunctionTool::new(
        ToolDescriptor::function("flaky", "Always fails", json!({ "type": "object" })),
        |_| async {
            Err(AgentError::ToolExecutionFailed {
                tool_name: "flaky".into(),
                reason: "backend unavailable".into(),
            })
        },
    ))
}

// ═══════════════════════════════════════════════════════════════════════
//  Plain answers
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn answer_without_tools_takes_one_turn() {
    let transport = ScriptedTransport::streaming(vec![streamed(response(
        "resp_1",
        vec![ConversationItem::assistant_text("4")],
    ))]);
    let mut orchestrator = TurnOrchestrator::new(transport.clone(), config()).unwrap();
    orchestrator.push_user_text("What is 2+2?");

    let outcome = orchestrator.next_response(true).await.unwrap();

    assert_eq!(outcome.output_text().as_deref(), Some("4"));
    assert_eq!(outcome.turns_used, 1);
    assert!(outcome.tool_outputs.is_empty());

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].stream);
    assert_eq!(requests[0].model, "test-model");
    assert_eq!(
        requests[0].input,
        vec![ConversationItem::user_text("What is 2+2?")]
    );

    // History now holds the question and the answer.
    assert_eq!(orchestrator.input().len(), 2);
    assert_eq!(orchestrator.previous_response_id(), Some("resp_1"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Tool calls
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn tool_output_feeds_next_turn() {
    let transport = ScriptedTransport::streaming(vec![
        streamed(response(
            "resp_1",
            vec![call("c1", "get_weather", json!({ "city": "Paris" }))],
        )),
        streamed(response(
            "resp_2",
            vec![ConversationItem::assistant_text("It is 22 degrees in Paris.")],
        )),
    ]);
    let mut orchestrator = TurnOrchestrator::new(transport.clone(), config())
        .unwrap()
        .with_tools(vec![weather_tool()])
        .unwrap();
    orchestrator.push_user_text("Weather in Paris?");

    let outcome = orchestrator.next_response(true).await.unwrap();

    assert_eq!(outcome.turns_used, 2);
    assert_eq!(
        outcome.output_text().as_deref(),
        Some("It is 22 degrees in Paris.")
    );

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(requests[0].tools[0].name, "get_weather");

    let second = &requests[1].input;
    assert_eq!(second.len(), 3);
    assert!(second[1].as_function_call().is_some());
    assert_eq!(
        second[2],
        ConversationItem::function_call_output("c1", r#"{"temp_c":22}"#)
    );
}

#[tokio::test]
async fn single_turn_stops_after_tool_outputs() {
    let transport = ScriptedTransport::streaming(vec![streamed(response(
        "resp_1",
        vec![call("c1", "get_weather", json!({ "city": "Paris" }))],
    ))]);
    let mut orchestrator = TurnOrchestrator::new(transport.clone(), config())
        .unwrap()
        .with_tools(vec![weather_tool()])
        .unwrap();
    orchestrator.push_user_text("Weather in Paris?");

    let outcome = orchestrator.next_response(false).await.unwrap();

    assert_eq!(outcome.turns_used, 1);
    assert!(outcome.output_text().is_none());
    assert_eq!(outcome.tool_outputs.len(), 1);
    assert_eq!(transport.requests().len(), 1);
    // The output is already queued for the next call.
    assert_eq!(
        orchestrator.input().last(),
        Some(&ConversationItem::function_call_output("c1", r#"{"temp_c":22}"#))
    );
}

#[tokio::test]
async fn outputs_keep_call_order_despite_completion_order() {
    let transport = ScriptedTransport::streaming(vec![streamed(response(
        "resp_1",
        vec![
            call("c1", "sleepy", json!({ "ms": 60 })),
            call("c2", "sleepy", json!({ "ms": 5 })),
            call("c3", "sleepy", json!({ "ms": 30 })),
        ],
    ))]);
    let mut orchestrator = TurnOrchestrator::new(transport, config())
        .unwrap()
        .with_tools(vec![sleepy_tool()])
        .unwrap();
    orchestrator.push_user_text("go");

    let outcome = orchestrator.next_response(false).await.unwrap();

    let call_ids: Vec<String> = outcome
        .tool_outputs
        .iter()
        .map(|item| match item {
            ConversationItem::FunctionCallOutput(out) => out.call_id.clone(),
            other => panic!("unexpected item: {other:?}"),
        })
        .collect();
    assert_eq!(call_ids, vec!["c1", "c2", "c3"]);
}

#[tokio::test]
async fn handler_failure_becomes_error_output() {
    let transport = ScriptedTransport::streaming(vec![
        streamed(response("resp_1", vec![call("c1", "flaky", json!({}))])),
        streamed(response(
            "resp_2",
            vec![ConversationItem::assistant_text("The backend is down.")],
        )),
    ]);
    let mut orchestrator = TurnOrchestrator::new(transport.clone(), config())
        .unwrap()
        .with_tools(vec![failing_tool()])
        .unwrap();
    orchestrator.push_user_text("try it");

    let outcome = orchestrator.next_response(true).await.unwrap();
    assert_eq!(outcome.turns_used, 2);

    let requests = transport.requests();
    let Some(ConversationItem::FunctionCallOutput(out)) = requests[1].input.last() else {
        panic!("expected a function call output");
    };
    let payload: serde_json::Value = serde_json::from_str(&out.output).unwrap();
    assert!(
        payload["error"]
            .as_str()
            .unwrap()
            .contains("backend unavailable")
    );
}

#[tokio::test]
async fn unknown_tool_fails_the_turn() {
    let transport = ScriptedTransport::streaming(vec![streamed(response(
        "resp_1",
        vec![call("c1", "launch_rockets", json!({}))],
    ))]);
    let mut orchestrator = TurnOrchestrator::new(transport, config())
        .unwrap()
        .with_tools(vec![weather_tool()])
        .unwrap();
    orchestrator.push_user_text("go");

    let err = orchestrator.next_response(true).await.unwrap_err();
    match err {
        AgentError::UnknownTool { name, call_id } => {
            assert_eq!(name, "launch_rockets");
            assert_eq!(call_id, "c1");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
#[allow(unreachable_code)]
async fn panicking_tool_leaves_sibling_calls_running() {
    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    let slow: Arc<dyn ToolHandler> = Arc::new(FunctionTool::new(
        ToolDescriptor::function("slow", "Finishes later", json!({"type": "object"})),
        move |_| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(json!("done"))
            }
        },
    ));
    let explode: Arc<dyn ToolHandler> = Arc::new(FunctionTool::new(
        ToolDescriptor::function("explode", "Panics", json!({"type": "object"})),
        |_| async move {
            panic!("tool blew up");
            Ok(json!(null))
        },
    ));

    let transport = ScriptedTransport::streaming(vec![streamed(response(
        "resp_1",
        vec![call("c1", "slow", json!({})), call("c2", "explode", json!({}))],
    ))]);
    let mut orchestrator = TurnOrchestrator::new(transport, config())
        .unwrap()
        .with_tools(vec![slow, explode])
        .unwrap();
    orchestrator.push_user_text("go");

    let err = orchestrator.next_response(true).await.unwrap_err();
    assert!(matches!(err, AgentError::Internal(_)), "unexpected error: {err:?}");

    tokio::time::timeout(Duration::from_secs(2), async {
        while !finished.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sibling tool task was aborted");
}

#[tokio::test]
async fn turn_limit_is_enforced() {
    let transport = ScriptedTransport::streaming(vec![streamed(response(
        "resp_1",
        vec![call("c1", "get_weather", json!({ "city": "Paris" }))],
    ))]);
    let config = OrchestratorConfig {
        max_turns: Some(1),
        ..config()
    };
    let mut orchestrator = TurnOrchestrator::new(transport.clone(), config)
        .unwrap()
        .with_tools(vec![weather_tool()])
        .unwrap();
    orchestrator.push_user_text("Weather in Paris?");

    let err = orchestrator.next_response(true).await.unwrap_err();
    assert!(matches!(err, AgentError::MaxTurnsExceeded { max_turns: 1 }));
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn duplicate_and_absent_tools_are_rejected() {
    let transport = ScriptedTransport::streaming(Vec::new());
    let mut orchestrator = TurnOrchestrator::new(transport, config())
        .unwrap()
        .with_tools(vec![weather_tool()])
        .unwrap();

    let err = orchestrator
        .add_tools(vec![sleepy_tool(), weather_tool()])
        .unwrap_err();
    assert!(matches!(err, AgentError::Kernel(_)));
    // Nothing from the rejected batch was attached.
    assert_eq!(orchestrator.tools().len(), 1);

    assert!(orchestrator.remove_tools(["get_weather", "missing"]).is_err());
    assert_eq!(orchestrator.tools().len(), 1);

    orchestrator.remove_tools(["get_weather"]).unwrap();
    assert!(orchestrator.tools().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Failures
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn missing_terminal_event_is_protocol_error() {
    let mut events = streamed(response(
        "resp_1",
        vec![ConversationItem::assistant_text("partial")],
    ));
    events.pop();

    let transport = ScriptedTransport::streaming(vec![events]);
    let mut orchestrator = TurnOrchestrator::new(transport, config()).unwrap();
    orchestrator.push_user_text("hello");

    let err = orchestrator.next_response(true).await.unwrap_err();
    match err {
        AgentError::MissingTerminalEvent { response_id } => {
            assert_eq!(response_id.as_deref(), Some("resp_1"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn failed_response_raises_service_error_and_is_observable() {
    let failed = Response {
        id: "resp_1".into(),
        status: Some(ResponseStatus::Failed),
        error: Some(ServiceError {
            code: Some("server_error".into()),
            message: "The model crashed".into(),
            ..ServiceError::default()
        }),
        ..Response::default()
    };
    let transport = ScriptedTransport::streaming(vec![streamed(failed)]);
    let mut orchestrator = TurnOrchestrator::new(transport, config()).unwrap();
    let mut rx = orchestrator.subscribe().unwrap();
    orchestrator.push_user_text("hello");

    let err = orchestrator.next_response(true).await.unwrap_err();
    match err {
        AgentError::Service { code, message, .. } => {
            assert_eq!(code.as_deref(), Some("server_error"));
            assert_eq!(message, "The model crashed");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind());
    }
    assert_eq!(kinds, vec!["response.created", "response.failed"]);
}

#[tokio::test]
async fn error_event_raises_service_error() {
    let events = vec![ServerEvent::Error(ErrorEvent {
        code: Some("rate_limit_exceeded".into()),
        message: Some("slow down".into()),
        ..ErrorEvent::default()
    })];
    let transport = ScriptedTransport::streaming(vec![events]);
    let mut orchestrator = TurnOrchestrator::new(transport, config()).unwrap();
    orchestrator.push_user_text("hello");

    let err = orchestrator.next_response(true).await.unwrap_err();
    assert!(err.is_service_error());
}

// ═══════════════════════════════════════════════════════════════════════
//  Modes
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn blocking_mode_runs_the_same_loop() {
    let transport = ScriptedTransport::blocking(vec![
        response(
            "resp_1",
            vec![call("c1", "get_weather", json!({ "city": "Paris" }))],
        ),
        response(
            "resp_2",
            vec![ConversationItem::assistant_text("22 degrees.")],
        ),
    ]);
    let config = OrchestratorConfig {
        mode: ResponseMode::Blocking,
        ..config()
    };
    let mut orchestrator = TurnOrchestrator::new(transport.clone(), config)
        .unwrap()
        .with_tools(vec![weather_tool()])
        .unwrap();
    orchestrator.push_user_text("Weather in Paris?");

    let outcome = orchestrator.next_response(true).await.unwrap();

    assert_eq!(outcome.turns_used, 2);
    assert_eq!(outcome.output_text().as_deref(), Some("22 degrees."));
    let requests = transport.requests();
    assert!(requests.iter().all(|r| !r.stream));
    assert_eq!(
        requests[1].input.last(),
        Some(&ConversationItem::function_call_output("c1", r#"{"temp_c":22}"#))
    );
}

#[tokio::test]
async fn server_state_mode_sends_only_new_items() {
    let transport = ScriptedTransport::streaming(vec![
        streamed(response(
            "resp_1",
            vec![call("c1", "get_weather", json!({ "city": "Paris" }))],
        )),
        streamed(response(
            "resp_2",
            vec![ConversationItem::assistant_text("22 degrees.")],
        )),
    ]);
    let config = OrchestratorConfig {
        use_server_state: true,
        ..config()
    };
    let mut orchestrator = TurnOrchestrator::new(transport.clone(), config)
        .unwrap()
        .with_tools(vec![weather_tool()])
        .unwrap();
    orchestrator.push_user_text("Weather in Paris?");

    orchestrator.next_response(true).await.unwrap();

    let requests = transport.requests();
    assert_eq!(requests[0].previous_response_id, None);
    assert_eq!(requests[0].store, Some(true));
    assert_eq!(requests[1].previous_response_id.as_deref(), Some("resp_1"));
    assert_eq!(
        requests[1].input,
        vec![ConversationItem::function_call_output("c1", r#"{"temp_c":22}"#)]
    );
    assert!(orchestrator.input().is_empty());
    assert_eq!(orchestrator.previous_response_id(), Some("resp_2"));
}

#[tokio::test]
async fn usage_sums_across_turns() {
    let usage = Usage {
        input_tokens: 10,
        output_tokens: 5,
        total_tokens: 15,
    };
    let mut first = response(
        "resp_1",
        vec![call("c1", "get_weather", json!({ "city": "Paris" }))],
    );
    first.usage = Some(usage);
    let mut second = response("resp_2", vec![ConversationItem::assistant_text("22.")]);
    second.usage = Some(usage);

    let transport = ScriptedTransport::streaming(vec![streamed(first), streamed(second)]);
    let mut orchestrator = TurnOrchestrator::new(transport, config())
        .unwrap()
        .with_tools(vec![weather_tool()])
        .unwrap();
    orchestrator.push_user_text("Weather in Paris?");

    let outcome = orchestrator.next_response(true).await.unwrap();
    assert_eq!(outcome.usage.total_tokens, 30);
    assert_eq!(outcome.usage.input_tokens, 20);
}
