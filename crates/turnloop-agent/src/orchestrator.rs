//! Turn orchestrator.
//!
//! Drives request/response conversations.  One *turn* is: build a request
//! from the accumulated input, submit it, process the resulting events
//! (running tool handlers concurrently as tool-call items complete), wait for
//! every tool output, then merge the response and the outputs into the input
//! of the next turn.  With auto-iteration the orchestrator keeps taking turns
//! until the model answers with text or stops asking for tools.
//!
//! ```text
//!   input ──> request ──> events ──┬─ output_item.done (tool call) ──> spawn handler
//!                                  ├─ response.completed ──────────> terminal
//!                                  └─ response.failed / error ─────> Err(Service)
//!
//!   terminal + all outputs ──> carry forward ──> next turn (or stop)
//! ```

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use turnloop_kernel::{EventBus, PendingOutputBarrier, ToolRegistry};
use turnloop_protocol::{
    ConversationItem, FunctionCallItem, Response, ResponseRequest, ServerEvent, ToolDescriptor,
    Usage,
};

use crate::config::AgentSettings;
use crate::error::{AgentError, Result};
use crate::tool::{ToolHandler, ToolInvocation, ToolOwner, run_tool};
use crate::transport::{ResponsesTransport, ServerEventStream, synthesize_events};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How a turn's response is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// One request, one complete response.
    Blocking,
    /// One request, a stream of events.
    #[default]
    Streaming,
}

/// Configuration for the turn loop.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub model: String,
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub tool_choice: Option<String>,
    pub parallel_tool_calls: Option<bool>,
    pub mode: ResponseMode,

    /// Reference the previous response by id instead of resending history.
    pub use_server_state: bool,

    /// Upper bound on turns per [`TurnOrchestrator::next_response`] call.
    pub max_turns: Option<u32>,

    /// Capacity of the observable event bus.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            instructions: None,
            temperature: None,
            top_p: None,
            max_output_tokens: None,
            tool_choice: None,
            parallel_tool_calls: None,
            mode: ResponseMode::Streaming,
            use_server_state: false,
            max_turns: None,
            event_capacity: 256,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(AgentError::Config {
                reason: "model must not be empty".into(),
            });
        }
        if self.max_turns == Some(0) {
            return Err(AgentError::Config {
                reason: "max_turns must be at least 1".into(),
            });
        }
        if self.event_capacity == 0 {
            return Err(AgentError::Config {
                reason: "event_capacity must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl From<&AgentSettings> for OrchestratorConfig {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            model: settings.model.clone(),
            instructions: settings.instructions.clone(),
            temperature: settings.temperature,
            top_p: settings.top_p,
            max_output_tokens: settings.max_output_tokens,
            mode: if settings.streaming {
                ResponseMode::Streaming
            } else {
                ResponseMode::Blocking
            },
            use_server_state: settings.use_server_state,
            max_turns: settings.max_turns,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of [`TurnOrchestrator::next_response`].
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The response of the last turn taken.
    pub response: Response,
    /// Number of turns taken by this call.
    pub turns_used: u32,
    /// Tool outputs produced during the last turn, in call order.
    pub tool_outputs: Vec<ConversationItem>,
    /// Token usage summed over every turn of this call.
    pub usage: Usage,
}

impl TurnOutcome {
    /// The final textual answer, if the last turn produced one.
    pub fn output_text(&self) -> Option<String> {
        self.response.output_text()
    }
}

/// Everything one turn produced.
struct TurnResult {
    response: Response,
    tool_outputs: Vec<ConversationItem>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Owns the conversation state of one request/response conversation.
pub struct TurnOrchestrator {
    id: Uuid,
    transport: Arc<dyn ResponsesTransport>,
    config: OrchestratorConfig,
    tools: ToolRegistry<Arc<dyn ToolHandler>>,
    /// Items sent with the next request.
    input: Vec<ConversationItem>,
    previous_response_id: Option<String>,
    last_response: Option<Response>,
    events: EventBus<ServerEvent>,
}

impl std::fmt::Debug for TurnOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnOrchestrator")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("tools", &self.tools.names())
            .field("input_items", &self.input.len())
            .field("previous_response_id", &self.previous_response_id)
            .finish_non_exhaustive()
    }
}

impl TurnOrchestrator {
    pub fn new(transport: Arc<dyn ResponsesTransport>, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);
        Ok(Self {
            id: Uuid::now_v7(),
            transport,
            config,
            tools: ToolRegistry::new(),
            input: Vec::new(),
            previous_response_id: None,
            last_response: None,
            events,
        })
    }

    /// Builder-style [`add_tools`](Self::add_tools).
    pub fn with_tools(mut self, handlers: Vec<Arc<dyn ToolHandler>>) -> Result<Self> {
        self.add_tools(handlers)?;
        Ok(self)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // -- Tools --------------------------------------------------------------

    /// Attach handlers.  All-or-nothing: a duplicate name attaches none.
    pub fn add_tools(&mut self, handlers: Vec<Arc<dyn ToolHandler>>) -> Result<()> {
        let batch: Vec<(String, Arc<dyn ToolHandler>)> = handlers
            .into_iter()
            .map(|h| (h.name().to_owned(), h))
            .collect();
        let attached: Vec<Arc<dyn ToolHandler>> = batch.iter().map(|(_, h)| Arc::clone(h)).collect();

        self.tools.attach(batch)?;
        for handler in attached {
            handler.on_attach(ToolOwner::Orchestrator(self.id));
        }
        Ok(())
    }

    /// Detach handlers by name.  All-or-nothing: an absent name detaches none.
    pub fn remove_tools<I, S>(&mut self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for handler in self.tools.detach(names)? {
            handler.on_detach(ToolOwner::Orchestrator(self.id));
        }
        Ok(())
    }

    /// Descriptors of the attached tools.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools
            .list()
            .into_iter()
            .map(|h| h.descriptor().clone())
            .collect()
    }

    // -- Conversation state -------------------------------------------------

    /// Append an item to the next request's input.
    pub fn push_input(&mut self, item: ConversationItem) {
        self.input.push(item);
    }

    pub fn push_user_text(&mut self, text: impl Into<String>) {
        self.push_input(ConversationItem::user_text(text));
    }

    /// Items that will be sent with the next request.
    pub fn input(&self) -> &[ConversationItem] {
        &self.input
    }

    pub fn previous_response_id(&self) -> Option<&str> {
        self.previous_response_id.as_deref()
    }

    pub fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }

    // -- Observation --------------------------------------------------------

    /// Receive every event processed from now on, in arrival order.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<Arc<ServerEvent>>> {
        Ok(self.events.subscribe()?)
    }

    pub fn events(&self) -> &EventBus<ServerEvent> {
        &self.events
    }

    // -- Turn loop ----------------------------------------------------------

    /// Take turns until the model has answered.
    ///
    /// Without `auto_iterate` exactly one turn is taken.  With it, turns
    /// continue while the last one produced tool outputs and no final text.
    pub async fn next_response(&mut self, auto_iterate: bool) -> Result<TurnOutcome> {
        let mut turns_used = 0u32;
        let mut usage = Usage::default();

        loop {
            if let Some(max_turns) = self.config.max_turns.filter(|max| turns_used >= *max) {
                warn!(orchestrator = %self.id, max_turns, "turn limit reached");
                return Err(AgentError::MaxTurnsExceeded { max_turns });
            }
            turns_used += 1;

            let request = self.build_request();
            info!(
                orchestrator = %self.id,
                turn = turns_used,
                input_items = request.input.len(),
                tools = request.tools.len(),
                "turn started"
            );

            let events = self.open_turn(&request).await?;
            let TurnResult {
                response,
                tool_outputs,
            } = self.drive_turn(events).await?;

            if let Some(turn_usage) = response.usage {
                usage += turn_usage;
            }
            self.carry_forward(&response, &tool_outputs);

            let answered = response.output_text().is_some();
            let stop = answered || !auto_iterate || tool_outputs.is_empty();
            info!(
                orchestrator = %self.id,
                turn = turns_used,
                response_id = %response.id,
                tool_outputs = tool_outputs.len(),
                answered,
                "turn completed"
            );

            self.last_response = Some(response.clone());
            if stop {
                return Ok(TurnOutcome {
                    response,
                    turns_used,
                    tool_outputs,
                    usage,
                });
            }
            debug!(orchestrator = %self.id, "continuing with tool outputs");
        }
    }

    fn build_request(&self) -> ResponseRequest {
        ResponseRequest {
            model: self.config.model.clone(),
            input: self.input.clone(),
            instructions: self.config.instructions.clone(),
            tools: self.tools(),
            tool_choice: self.config.tool_choice.clone(),
            parallel_tool_calls: self.config.parallel_tool_calls,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            max_output_tokens: self.config.max_output_tokens,
            previous_response_id: if self.config.use_server_state {
                self.previous_response_id.clone()
            } else {
                None
            },
            store: self.config.use_server_state.then_some(true),
            stream: self.config.mode == ResponseMode::Streaming,
        }
    }

    /// Submit the request and return its events, synthesizing them for a
    /// blocking response.
    async fn open_turn(&self, request: &ResponseRequest) -> Result<ServerEventStream> {
        match self.config.mode {
            ResponseMode::Streaming => self.transport.stream_response(request).await,
            ResponseMode::Blocking => {
                let response = self.transport.create_response(request).await?;
                let events = synthesize_events(response);
                Ok(stream::iter(events.into_iter().map(Ok)).boxed())
            }
        }
    }

    /// Process one turn's events until the terminal event has arrived and
    /// every tool output is in.
    ///
    /// On failure, tool tasks already running are detached; their outputs
    /// are discarded.
    async fn drive_turn(&self, mut events: ServerEventStream) -> Result<TurnResult> {
        let mut barrier: PendingOutputBarrier<String, ConversationItem> =
            PendingOutputBarrier::new();
        let mut running: JoinSet<(String, ConversationItem)> = JoinSet::new();
        let mut terminal: Option<Response> = None;
        let mut response_id: Option<String> = None;

        loop {
            tokio::select! {
                biased;

                Some(joined) = running.join_next(), if !running.is_empty() => {
                    let (call_id, output) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            running.detach_all();
                            return Err(AgentError::Internal(format!(
                                "tool execution task panicked: {e}"
                            )));
                        }
                    };
                    match barrier.resolve(&call_id, output) {
                        Ok(true) => debug!(orchestrator = %self.id, "all tool outputs resolved"),
                        Ok(false) => {}
                        Err(e) => {
                            running.detach_all();
                            return Err(e.into());
                        }
                    }
                }

                next = events.next(), if terminal.is_none() => {
                    let event = match next {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            running.detach_all();
                            return Err(e);
                        }
                        None => {
                            running.detach_all();
                            warn!(orchestrator = %self.id, response_id = ?response_id, "event stream ended without terminal event");
                            return Err(AgentError::MissingTerminalEvent { response_id });
                        }
                    };

                    match self.observe(event, &mut barrier, &mut running, &mut response_id) {
                        Ok(Some(response)) => terminal = Some(response),
                        Ok(None) => {}
                        Err(e) => {
                            running.detach_all();
                            return Err(e);
                        }
                    }
                }

                else => break,
            }
        }

        let response = terminal.ok_or(AgentError::MissingTerminalEvent { response_id })?;
        let tool_outputs = barrier.take_outputs()?;
        Ok(TurnResult {
            response,
            tool_outputs,
        })
    }

    /// Handle one event.  Returns the response once the terminal event
    /// arrives.
    fn observe(
        &self,
        event: ServerEvent,
        barrier: &mut PendingOutputBarrier<String, ConversationItem>,
        running: &mut JoinSet<(String, ConversationItem)>,
        response_id: &mut Option<String>,
    ) -> Result<Option<Response>> {
        // Observers see every event, including failures.
        self.events.publish(event.clone())?;

        match event {
            ServerEvent::ResponseCreated { response, .. }
            | ServerEvent::ResponseInProgress { response, .. } => {
                *response_id = Some(response.id);
                Ok(None)
            }
            ServerEvent::OutputItemDone {
                item: ConversationItem::FunctionCall(call),
                ..
            } => {
                self.dispatch_tool_call(&call, barrier, running)?;
                Ok(None)
            }
            ServerEvent::ResponseCompleted { response, .. }
            | ServerEvent::ResponseIncomplete { response, .. } => Ok(Some(response)),
            ServerEvent::ResponseFailed { response, .. } => {
                let error = response.error.unwrap_or_default();
                warn!(orchestrator = %self.id, response_id = %response.id, error = %error, "response failed");
                Err(error.into())
            }
            ServerEvent::Error(error) => {
                let error = error.to_service_error();
                warn!(orchestrator = %self.id, error = %error, "service error event");
                Err(error.into())
            }
            ServerEvent::OutputItemAdded { .. }
            | ServerEvent::OutputItemDone { .. }
            | ServerEvent::OutputTextDelta { .. }
            | ServerEvent::OutputTextDone { .. }
            | ServerEvent::FunctionCallArgumentsDelta { .. }
            | ServerEvent::FunctionCallArgumentsDone { .. }
            | ServerEvent::ResponseDone { .. }
            | ServerEvent::SessionCreated { .. }
            | ServerEvent::SessionUpdated { .. }
            | ServerEvent::ConversationItemCreated { .. }
            | ServerEvent::Unknown => Ok(None),
        }
    }

    /// Register the call with the barrier and run its handler.
    fn dispatch_tool_call(
        &self,
        call: &FunctionCallItem,
        barrier: &mut PendingOutputBarrier<String, ConversationItem>,
        running: &mut JoinSet<(String, ConversationItem)>,
    ) -> Result<()> {
        let handler = self
            .tools
            .list()
            .into_iter()
            .find(|h| h.matches(call))
            .cloned()
            .ok_or_else(|| AgentError::UnknownTool {
                name: call.name.clone(),
                call_id: call.call_id.clone(),
            })?;

        barrier.register(call.call_id.clone())?;
        debug!(orchestrator = %self.id, tool = %call.name, call_id = %call.call_id, "dispatching tool call");

        let invocation = ToolInvocation::from_call(call);
        running.spawn(async move {
            let call_id = invocation.call_id.clone();
            let output = run_tool(handler.as_ref(), invocation).await;
            (call_id, output)
        });
        Ok(())
    }

    /// Merge a finished turn into the next request's input.
    fn carry_forward(&mut self, response: &Response, tool_outputs: &[ConversationItem]) {
        if !response.id.is_empty() {
            self.previous_response_id = Some(response.id.clone());
        }

        if self.config.use_server_state {
            // The service already holds everything up to this response.
            self.input = tool_outputs.to_vec();
        } else {
            self.input.extend(response.output.iter().cloned());
            self.input.extend(tool_outputs.iter().cloned());
        }
    }
}
