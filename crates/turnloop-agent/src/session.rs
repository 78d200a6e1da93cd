//! Session controller.
//!
//! Manages a persistent duplex session: inbound server events arrive on a
//! stream, outbound client events go through an [`EventSink`].  The
//! controller
//!
//! - gates every outbound send on the handshake (`session.created`),
//! - keeps the remote tool list in sync with the attached handlers,
//! - runs a handler for each completed tool-call item addressed to it and
//!   answers with the output item followed by a response request,
//! - exposes inbound, outbound and error events on separate buses.
//!
//! ```text
//!   Uninitialized ──session.created──> Ready ──dispose()──> Closed
//!        │                                                    ^
//!        └──────────────────────dispose()─────────────────────┘
//! ```
//!
//! Lock order: `lifecycle` (async) before `tools` (sync, never held across
//! an await).  Tool outputs are delivered under a read lock on `lifecycle`;
//! `dispose` and tool-set changes take the write lock, so no output is sent
//! after the session closed or after its tool was detached.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::StreamExt;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use turnloop_kernel::{EventBus, Subscription, ToolRegistry};
use turnloop_protocol::{
    ClientEvent, ConversationItem, ServerEvent, ServiceError, SessionConfig, ToolDescriptor,
};

use crate::error::{AgentError, Result};
use crate::tool::{ToolHandler, ToolInvocation, ToolOwner, run_tool};
use crate::transport::{EventSink, ServerEventStream};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for `session.created`.
    Uninitialized,
    Ready,
    Closed,
}

/// Errors surfaced on the session's error bus.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// The remote side sent an `error` event.
    #[error("service error: {0}")]
    Service(ServiceError),

    /// Sending or receiving failed.
    #[error("transport error: {reason}")]
    Transport { reason: String },
}

/// Options for [`SessionController::start`].
pub struct SessionOptions {
    /// Configuration sent with the first `session.update`.
    pub session: Option<SessionConfig>,
    /// Handlers attached before the handshake.
    pub tools: Vec<Arc<dyn ToolHandler>>,
    /// Capacity of each event bus.
    pub event_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            session: None,
            tools: Vec::new(),
            event_capacity: 256,
        }
    }
}

impl SessionOptions {
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn ToolHandler>>) -> Self {
        self.tools = tools;
        self
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Lifecycle {
    state: SessionState,
    /// Last configuration reported by the remote side.
    session: Option<SessionConfig>,
    /// A tool-list update is owed once the session is ready.
    sync_pending: bool,
    /// Configuration merged into the first update.
    initial: Option<SessionConfig>,
}

struct AttachedTool {
    handler: Arc<dyn ToolHandler>,
    /// Distinguishes this attachment from a later one under the same name.
    attachment: Uuid,
    listener: Subscription,
}

struct SessionInner {
    id: Uuid,
    sink: Arc<dyn EventSink>,
    lifecycle: RwLock<Lifecycle>,
    state_tx: watch::Sender<SessionState>,
    tools: Mutex<ToolRegistry<AttachedTool>>,
    inbound: EventBus<ServerEvent>,
    outbound: EventBus<ClientEvent>,
    errors: EventBus<SessionError>,
    pump: Mutex<Option<Subscription>>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Handle to a persistent session.  Cheap to clone.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Start consuming `events`.  Requires a tokio runtime.
    ///
    /// Initial tools are attached before the first event is read, so no
    /// tool call can be missed.
    pub fn start(
        sink: Arc<dyn EventSink>,
        events: ServerEventStream,
        options: SessionOptions,
    ) -> Result<Self> {
        let SessionOptions {
            session,
            tools,
            event_capacity,
        } = options;
        if event_capacity == 0 {
            return Err(AgentError::Config {
                reason: "event_capacity must be at least 1".into(),
            });
        }

        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        let inner = Arc::new(SessionInner {
            id: Uuid::now_v7(),
            sink,
            lifecycle: RwLock::new(Lifecycle {
                state: SessionState::Uninitialized,
                session: None,
                sync_pending: session.is_some() || !tools.is_empty(),
                initial: session,
            }),
            state_tx,
            tools: Mutex::new(ToolRegistry::new()),
            inbound: EventBus::new(event_capacity),
            outbound: EventBus::new(event_capacity),
            errors: EventBus::new(event_capacity),
            pump: Mutex::new(None),
        });

        let tool_count = tools.len();
        inner.attach(tools)?;

        let pump = SessionInner::spawn_pump(&inner, events);
        *inner.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);

        info!(session = %inner.id, tools = tool_count, "session controller started");
        Ok(Self { inner })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Resolve once the handshake completed.  Fails with
    /// [`AgentError::SessionClosed`] if the session closes first.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let mut rx = self.inner.state_tx.subscribe();
        let state = *rx
            .wait_for(|state| *state != SessionState::Uninitialized)
            .await
            .map_err(|_| AgentError::SessionClosed)?;

        match state {
            SessionState::Ready => Ok(()),
            _ => Err(AgentError::SessionClosed),
        }
    }

    /// The configuration last reported by the remote side.
    pub async fn session(&self) -> Option<SessionConfig> {
        self.inner.lifecycle.read().await.session.clone()
    }

    /// Send a client event.
    ///
    /// Fails with [`AgentError::SessionNotReady`] before the handshake and
    /// [`AgentError::SessionClosed`] after [`dispose`](Self::dispose).
    pub async fn send(&self, event: ClientEvent) -> Result<()> {
        let lifecycle = self.inner.lifecycle.read().await;
        self.inner.transmit(&lifecycle, event).await
    }

    /// Add a user message to the conversation and ask for a response.
    pub async fn send_user_text(&self, text: impl Into<String>) -> Result<()> {
        let lifecycle = self.inner.lifecycle.read().await;
        self.inner
            .transmit(
                &lifecycle,
                ClientEvent::item_create(ConversationItem::user_text(text)),
            )
            .await?;
        self.inner
            .transmit(&lifecycle, ClientEvent::response_create())
            .await
    }

    // -- Tools --------------------------------------------------------------

    /// Attach handlers and advertise them.  All-or-nothing.
    ///
    /// Before the handshake the update is deferred and sent once, with the
    /// full tool list, when the session becomes ready.
    pub async fn add_tools(&self, handlers: Vec<Arc<dyn ToolHandler>>) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.write().await;
        if lifecycle.state == SessionState::Closed {
            return Err(AgentError::SessionClosed);
        }

        self.inner.attach(handlers)?;
        self.inner.sync_tools(&mut lifecycle).await
    }

    /// Detach handlers by name and advertise the remaining ones.
    /// All-or-nothing.
    ///
    /// Outputs of invocations still running for a removed handler are
    /// discarded.
    pub async fn remove_tools<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut lifecycle = self.inner.lifecycle.write().await;
        if lifecycle.state == SessionState::Closed {
            return Err(AgentError::SessionClosed);
        }

        let removed = self
            .inner
            .tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detach(names)?;
        self.inner.release(removed);
        self.inner.sync_tools(&mut lifecycle).await
    }

    /// Descriptors of the attached tools.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.inner.descriptors()
    }

    // -- Observation --------------------------------------------------------

    /// Every inbound event, in arrival order.
    pub fn inbound(&self) -> &EventBus<ServerEvent> {
        &self.inner.inbound
    }

    /// Every client event actually sent.
    pub fn outbound(&self) -> &EventBus<ClientEvent> {
        &self.inner.outbound
    }

    /// Service and transport errors.
    pub fn errors(&self) -> &EventBus<SessionError> {
        &self.inner.errors
    }

    // -- Shutdown -----------------------------------------------------------

    /// Close the session.  Idempotent.
    ///
    /// Stops reading inbound events, detaches every handler, closes the
    /// buses, then closes the sink.  Tool invocations still running finish
    /// but their outputs are discarded.
    pub async fn dispose(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.write().await;
        if lifecycle.state == SessionState::Closed {
            return Ok(());
        }
        lifecycle.state = SessionState::Closed;
        lifecycle.sync_pending = false;
        self.inner.state_tx.send_replace(SessionState::Closed);

        let pump = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.cancel();
        }

        let detached = self
            .inner
            .tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detach_all();
        self.inner.release(detached);

        self.inner.inbound.close();
        self.inner.outbound.close();
        self.inner.errors.close();
        drop(lifecycle);

        info!(session = %self.inner.id, "session closed");
        self.inner.sink.close().await
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

impl SessionInner {
    /// Read inbound events until the stream ends.
    fn spawn_pump(inner: &Arc<Self>, mut events: ServerEventStream) -> Subscription {
        let weak = Arc::downgrade(inner);
        Subscription::spawn(async move {
            while let Some(next) = events.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match next {
                    Ok(event) => inner.handle_server_event(event).await,
                    Err(e) => {
                        warn!(session = %inner.id, error = %e, "inbound stream error");
                        inner.report(SessionError::Transport {
                            reason: e.to_string(),
                        });
                    }
                }
            }
            debug!("inbound stream ended");
        })
    }

    async fn handle_server_event(&self, event: ServerEvent) {
        trace!(session = %self.id, event = event.kind(), "server event");

        match &event {
            ServerEvent::SessionCreated { session, .. } => self.on_session_created(session).await,
            ServerEvent::SessionUpdated { session, .. } => {
                let mut lifecycle = self.lifecycle.write().await;
                if lifecycle.state == SessionState::Ready {
                    lifecycle.session = Some(session.clone());
                    debug!(session = %self.id, "session configuration updated");
                } else {
                    debug!(session = %self.id, state = ?lifecycle.state, "ignoring session update outside Ready");
                }
            }
            ServerEvent::Error(error) => {
                let error = error.to_service_error();
                warn!(session = %self.id, code = ?error.code, message = %error.message, "service reported error");
                self.report(SessionError::Service(error));
            }
            _ => {}
        }

        if self.inbound.publish(event).is_err() {
            trace!(session = %self.id, "inbound bus closed; event dropped");
        }
    }

    async fn on_session_created(&self, session: &SessionConfig) {
        let mut lifecycle = self.lifecycle.write().await;
        match lifecycle.state {
            SessionState::Uninitialized => {
                lifecycle.state = SessionState::Ready;
                lifecycle.session = Some(session.clone());
                self.state_tx.send_replace(SessionState::Ready);
                info!(session = %self.id, remote_id = ?session.id, "session ready");

                if std::mem::take(&mut lifecycle.sync_pending) {
                    let initial = lifecycle.initial.take();
                    let update = self.tool_sync_update(initial);
                    if let Err(e) = self.transmit(&lifecycle, update).await {
                        warn!(session = %self.id, error = %e, "initial session update failed");
                        self.report(SessionError::Transport {
                            reason: e.to_string(),
                        });
                    }
                }
            }
            SessionState::Ready => {
                warn!(session = %self.id, "repeated session.created; refreshing configuration");
                lifecycle.session = Some(session.clone());
            }
            SessionState::Closed => {}
        }
    }

    /// Send `event` if the session is ready, then publish it as outbound.
    async fn transmit(&self, lifecycle: &Lifecycle, event: ClientEvent) -> Result<()> {
        match lifecycle.state {
            SessionState::Ready => {}
            SessionState::Uninitialized => return Err(AgentError::SessionNotReady),
            SessionState::Closed => return Err(AgentError::SessionClosed),
        }

        self.sink.send(&event).await?;
        trace!(session = %self.id, event = event.kind(), "client event sent");
        self.outbound.publish(event)?;
        Ok(())
    }

    /// Advertise the current tool list now, or once the session is ready.
    async fn sync_tools(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        match lifecycle.state {
            SessionState::Ready => {
                let update = self.tool_sync_update(None);
                self.transmit(lifecycle, update).await
            }
            SessionState::Uninitialized => {
                debug!(session = %self.id, "tool update deferred until session is ready");
                lifecycle.sync_pending = true;
                Ok(())
            }
            SessionState::Closed => Err(AgentError::SessionClosed),
        }
    }

    fn tool_sync_update(&self, base: Option<SessionConfig>) -> ClientEvent {
        let mut session = base.unwrap_or_default();
        session.tools = Some(self.descriptors());
        ClientEvent::session_update(session)
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .list()
            .into_iter()
            .map(|t| t.handler.descriptor().clone())
            .collect()
    }

    fn is_attached(&self, tool: &str, attachment: Uuid) -> bool {
        self.tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool)
            .is_some_and(|t| t.attachment == attachment)
    }

    fn report(&self, error: SessionError) {
        if self.errors.publish(error).is_err() {
            trace!(session = %self.id, "error bus closed; error dropped");
        }
    }

    // -- Tool attachment ----------------------------------------------------

    /// Start a listener per handler and attach them.  On a rejected batch
    /// the new listeners are dropped, which stops them.
    fn attach(self: &Arc<Self>, handlers: Vec<Arc<dyn ToolHandler>>) -> Result<()> {
        let mut batch = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let attachment = Uuid::now_v7();
            let listener = self.spawn_tool_listener(Arc::clone(&handler), attachment)?;
            batch.push((
                handler.name().to_owned(),
                AttachedTool {
                    handler,
                    attachment,
                    listener,
                },
            ));
        }
        let attached: Vec<Arc<dyn ToolHandler>> =
            batch.iter().map(|(_, t)| Arc::clone(&t.handler)).collect();

        self.tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attach(batch)?;

        for handler in attached {
            handler.on_attach(ToolOwner::Session(self.id));
        }
        Ok(())
    }

    /// Stop listeners of detached handlers and notify them.
    fn release(&self, detached: Vec<AttachedTool>) {
        for tool in detached {
            tool.listener.cancel();
            tool.handler.on_detach(ToolOwner::Session(self.id));
        }
    }

    fn spawn_tool_listener(
        self: &Arc<Self>,
        handler: Arc<dyn ToolHandler>,
        attachment: Uuid,
    ) -> Result<Subscription> {
        let weak = Arc::downgrade(self);
        let matcher = Arc::clone(&handler);

        let listener = self.inbound.listen(
            move |event: &ServerEvent| {
                event
                    .completed_function_call()
                    .is_some_and(|call| matcher.matches(call))
            },
            move |event: Arc<ServerEvent>| {
                let weak = Weak::clone(&weak);
                let handler = Arc::clone(&handler);
                async move {
                    if let Some(call) = event.completed_function_call() {
                        let invocation = ToolInvocation::from_call(call);
                        tokio::spawn(run_invocation(weak, handler, attachment, invocation));
                    }
                }
            },
        )?;
        Ok(listener)
    }

    async fn deliver_tool_output(
        &self,
        tool: &str,
        call_id: &str,
        attachment: Uuid,
        output: ConversationItem,
    ) {
        let lifecycle = self.lifecycle.read().await;
        if lifecycle.state != SessionState::Ready {
            debug!(session = %self.id, tool, call_id, state = ?lifecycle.state, "session not ready; discarding tool output");
            return;
        }
        if !self.is_attached(tool, attachment) {
            debug!(session = %self.id, tool, call_id, "tool detached while running; discarding output");
            return;
        }

        for event in [
            ClientEvent::item_create(output),
            ClientEvent::response_create(),
        ] {
            if let Err(e) = self.transmit(&lifecycle, event).await {
                warn!(session = %self.id, tool, call_id, error = %e, "failed to deliver tool output");
                self.report(SessionError::Transport {
                    reason: e.to_string(),
                });
                return;
            }
        }
        debug!(session = %self.id, tool, call_id, "tool output delivered");
    }
}

/// Run one invocation and deliver its output if the session and the
/// attachment are still alive.
async fn run_invocation(
    weak: Weak<SessionInner>,
    handler: Arc<dyn ToolHandler>,
    attachment: Uuid,
    invocation: ToolInvocation,
) {
    let call_id = invocation.call_id.clone();
    let output = run_tool(handler.as_ref(), invocation).await;

    let Some(inner) = weak.upgrade() else {
        debug!(call_id = %call_id, "session dropped; discarding tool output");
        return;
    };
    inner
        .deliver_tool_output(handler.name(), &call_id, attachment, output)
        .await;
}
