//! Session Controller
//!
//! Owns the per-display context and the set of authentication conversations,
//! drives the verification state machine for each, and enforces the single
//! cross-conversation invariant: at most one conversation ever becomes the
//! running session.
//!
//! All state transitions happen on one sequential control flow: channel
//! events and worker job events are funneled into a single [`SessionEvent`]
//! stream drained by [`SessionController::dispatch`], and the controller's
//! verb methods take `&mut self`, so the borrow checker serializes them with
//! event delivery. No locks are needed around the conversation map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::{
    ChannelEvent, ChannelServer, ConnectionId, ControllerVerb, SecretString, WorkerMessage,
};
use crate::config::DaemonConfig;
use crate::error::{
    CancelledQuery, ProtocolViolation, SessionCrash, SpawnError, VerificationError,
};

use super::context::SessionContext;
use super::conversation::{Conversation, ConversationState, PendingQuery, QueuedSetup};
use super::record::{LogRecordSink, NullRecordSink, SessionRecord, SessionRecordSink};
use super::worker_job::{JobEvent, WorkerJob};

/// Everything that can happen to a session controller, as one event stream.
///
/// The controller is the only subscriber; there is no signal fan-out and
/// therefore no re-entrancy while an event is being handled.
#[derive(Debug)]
pub enum SessionEvent {
    /// Something happened on the control channel
    Channel(ChannelEvent),
    /// Something happened to a conversation's worker process
    Job {
        /// Conversation the job belongs to
        service_name: String,
        /// The process lifecycle event
        event: JobEvent,
    },
}

/// Outcome signals delivered upward to the embedding layer (greeter UI,
/// display supervision, both out of scope here).
///
/// `SessionStopped` is deliberately its own variant, never folded into
/// `SessionStarted` handling: a deliberately stopped session and a freshly
/// started one must stay distinguishable to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// A worker authenticated its channel connection; the conversation is live
    ConversationStarted {
        /// Conversation service name
        service_name: String,
    },
    /// A conversation was torn down; its worker is gone
    ConversationStopped {
        /// Conversation service name
        service_name: String,
    },
    /// The authentication service cannot run
    ServiceUnavailable {
        /// Conversation service name
        service_name: String,
        /// Worker-provided explanation
        message: String,
    },
    /// Setup finished for a conversation
    SetupComplete {
        /// Conversation service name
        service_name: String,
    },
    /// Setup failed
    SetupFailed {
        /// Conversation service name
        service_name: String,
        /// Worker-provided explanation
        message: String,
    },
    /// Identity proven
    Authenticated {
        /// Conversation service name
        service_name: String,
    },
    /// Identity could not be proven
    AuthenticationFailed {
        /// Conversation service name
        service_name: String,
        /// Worker-provided explanation
        message: String,
    },
    /// Login permitted
    Authorized {
        /// Conversation service name
        service_name: String,
    },
    /// Login not permitted
    AuthorizationFailed {
        /// Conversation service name
        service_name: String,
        /// Worker-provided explanation
        message: String,
    },
    /// Credentials established
    Accredited {
        /// Conversation service name
        service_name: String,
    },
    /// Credentials could not be established
    AccreditationFailed {
        /// Conversation service name
        service_name: String,
        /// Worker-provided explanation
        message: String,
    },
    /// Session opened with the authentication stack
    SessionOpened {
        /// Conversation service name
        service_name: String,
        /// Backend-assigned session id, when there is one
        session_id: Option<String>,
    },
    /// Session could not be opened
    SessionOpenFailed {
        /// Conversation service name
        service_name: String,
        /// Worker-provided explanation
        message: String,
    },
    /// The session program is running; this conversation is now the session
    SessionStarted {
        /// Conversation service name
        service_name: String,
        /// Pid of the session program
        pid: i32,
    },
    /// The session program could not be started
    SessionStartFailed {
        /// Conversation service name
        service_name: String,
        /// Worker-provided explanation
        message: String,
    },
    /// The running session exited on its own
    SessionExited {
        /// Exit status
        status: i32,
    },
    /// The running session was killed
    SessionDied {
        /// Fatal signal
        signal: i32,
    },
    /// The running session was stopped deliberately
    SessionStopped {
        /// Conversation service name
        service_name: String,
    },
    /// A worker went away before verification completed
    VerificationFailed {
        /// Conversation service name
        service_name: String,
        /// What happened
        error: VerificationError,
    },
    /// Informational text from the worker, relayed verbatim
    Info {
        /// Conversation service name
        service_name: String,
        /// Text to show
        text: String,
    },
    /// Problem text from the worker, relayed verbatim
    Problem {
        /// Conversation service name
        service_name: String,
        /// Text to show
        text: String,
    },
    /// The worker asks the user a question
    InfoQuery {
        /// Conversation service name
        service_name: String,
        /// Prompt to show
        prompt: String,
    },
    /// The worker asks the user a question whose answer must stay secret
    SecretInfoQuery {
        /// Conversation service name
        service_name: String,
        /// Prompt to show
        prompt: String,
    },
    /// The pending query was resolved by cancellation, not an answer
    QueryCancelled {
        /// Conversation service name
        service_name: String,
    },
    /// Authentication established or corrected the username
    UsernameChanged {
        /// Conversation service name
        service_name: String,
        /// The new username
        username: String,
    },
    /// The effective default session name changed
    DefaultSessionChanged {
        /// New default session name
        name: String,
    },
    /// The effective default language changed
    DefaultLanguageChanged {
        /// New default language
        name: String,
    },
}

/// Orchestrates the authentication conversations of one display.
pub struct SessionController {
    config: Arc<DaemonConfig>,
    context: SessionContext,
    conversations: HashMap<String, Conversation>,
    /// Authenticated connection → conversation service name
    authenticated: HashMap<ConnectionId, String>,
    /// Accepted but not yet hello-authenticated connections
    pending_connections: HashMap<ConnectionId, crate::channel::ConnectionHandle>,
    session_conversation: Option<String>,
    session_pid: Option<i32>,
    session_record: Option<SessionRecord>,
    server: Option<ChannelServer>,
    channel_tx: mpsc::UnboundedSender<ChannelEvent>,
    channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    job_tx: mpsc::UnboundedSender<(String, JobEvent)>,
    job_rx: mpsc::UnboundedReceiver<(String, JobEvent)>,
    outcomes: mpsc::UnboundedSender<SessionOutcome>,
    record: Arc<dyn SessionRecordSink>,
    for_reauth: bool,
    closed: bool,
}

impl SessionController {
    /// Create a controller and its private channel server.
    ///
    /// Returns the receiver on which outcome signals are delivered to the
    /// embedding layer.
    pub fn new(
        config: Arc<DaemonConfig>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionOutcome>), crate::error::TransportError>
    {
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

        let server = ChannelServer::start(&config.channel, channel_tx.clone())?;

        let record: Arc<dyn SessionRecordSink> = if config.record.enabled {
            Arc::new(LogRecordSink)
        } else {
            Arc::new(NullRecordSink)
        };

        let controller = Self {
            config,
            context: SessionContext::new(),
            conversations: HashMap::new(),
            authenticated: HashMap::new(),
            pending_connections: HashMap::new(),
            session_conversation: None,
            session_pid: None,
            session_record: None,
            server: Some(server),
            channel_tx,
            channel_rx,
            job_tx,
            job_rx,
            outcomes: outcomes_tx,
            record,
            for_reauth: false,
            closed: false,
        };

        Ok((controller, outcomes_rx))
    }

    /// Replace the session record sink
    pub fn set_record_sink(&mut self, sink: Arc<dyn SessionRecordSink>) {
        self.record = sink;
    }

    /// Mark this controller as driving a reauthentication flow
    pub fn set_for_reauth(&mut self, for_reauth: bool) {
        self.for_reauth = for_reauth;
    }

    /// Address workers must dial back to
    pub fn server_address(&self) -> String {
        self.server
            .as_ref()
            .map(|server| server.address().display().to_string())
            .unwrap_or_default()
    }

    /// Shared per-display context, for the embedding layer to populate
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Mutable access to the shared context; callers must stay on the
    /// controller's own control flow
    pub fn context_mut(&mut self) -> &mut SessionContext {
        &mut self.context
    }

    /// Pid of the running session program, once one started
    pub fn session_pid(&self) -> Option<i32> {
        self.session_pid
    }

    /// Service name of the conversation that became the session
    pub fn session_service(&self) -> Option<&str> {
        self.session_conversation.as_deref()
    }

    /// Whether a conversation exists under this name
    pub fn has_conversation(&self, service_name: &str) -> bool {
        self.conversations.contains_key(service_name)
    }

    /// State of a conversation, when it exists
    pub fn conversation_state(&self, service_name: &str) -> Option<ConversationState> {
        self.conversations
            .get(service_name)
            .map(|conversation| conversation.state())
    }

    /// Whether `close` already ran
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ------------------------------------------------------------------
    // Conversation lifecycle
    // ------------------------------------------------------------------

    /// Start a conversation for an authentication service.
    ///
    /// A second start under a name whose conversation is still live is a
    /// logged no-op; a leftover draining conversation is force-terminated
    /// first. On spawn failure the service is reported unavailable and no
    /// conversation exists afterwards.
    pub async fn start_conversation(&mut self, service_name: &str) -> Result<(), SpawnError> {
        if let Some(existing) = self.conversations.get(service_name) {
            if !existing.is_stopping() {
                warn!(
                    "Conversation {} started more than once; ignoring",
                    service_name
                );
                return Ok(());
            }

            debug!("Replacing draining conversation {}", service_name);
            let mut old = self.conversations.remove(service_name).unwrap();
            if let Some(handle) = old.detach_connection() {
                self.authenticated.remove(&handle.id());
            }
            old.job_mut().stop_now().await;
        }

        debug!("Starting conversation {}", service_name);

        let mut job = WorkerJob::new(
            &self.config.worker.command,
            Duration::from_secs(self.config.worker.stop_timeout_secs),
        );
        job.set_server_address(self.server_address());
        job.set_for_reauth(self.for_reauth);
        if !self.config.worker.environment.is_empty() {
            job.set_environment(self.config.worker.environment.clone());
        }

        // Job events carry no conversation knowledge; tag them here.
        let (job_events_tx, mut job_events_rx) = mpsc::unbounded_channel();
        let forward = self.job_tx.clone();
        let tag = service_name.to_string();
        tokio::spawn(async move {
            while let Some(event) = job_events_rx.recv().await {
                if forward.send((tag.clone(), event)).is_err() {
                    break;
                }
            }
        });

        let job_name = format!("{} [auth/{}]", worker_binary_name(&self.config.worker.command), service_name);

        if let Err(e) = job.start(&job_name, job_events_tx) {
            warn!("Could not start worker for {}: {}", service_name, e);
            self.emit(SessionOutcome::ServiceUnavailable {
                service_name: service_name.to_string(),
                message: e.to_string(),
            });
            return Err(e);
        }

        self.conversations.insert(
            service_name.to_string(),
            Conversation::new(service_name, job),
        );

        Ok(())
    }

    /// Gracefully stop a conversation.
    ///
    /// Resolves any pending query with a cancellation, closes the channel,
    /// and asks the worker to terminate; the exit is then an expected event
    /// that finalizes the conversation.
    pub fn stop_conversation(&mut self, service_name: &str) {
        let Some(conversation) = self.conversations.get_mut(service_name) else {
            warn!("Tried to stop non-existent conversation {}", service_name);
            return;
        };

        debug!("Stopping conversation {}", service_name);

        // Pending queries are resolved before the channel goes away so no
        // caller is left awaiting an answer.
        let cancelled_query = conversation.take_pending_query().is_some();
        if cancelled_query {
            conversation.send(ControllerVerb::Cancelled);
        }

        conversation.set_stopping();

        if let Some(handle) = conversation.detach_connection() {
            self.authenticated.remove(&handle.id());
        }

        self.conversations[service_name].job().request_stop();

        if cancelled_query {
            self.emit(SessionOutcome::QueryCancelled {
                service_name: service_name.to_string(),
            });
        }
    }

    fn stop_all_other_conversations(&mut self, keep: &str) {
        let others: Vec<String> = self
            .conversations
            .keys()
            .filter(|name| name.as_str() != keep)
            .cloned()
            .collect();

        if !others.is_empty() {
            debug!("Stopping all conversations except {}", keep);
        }

        for service_name in others {
            self.stop_conversation(&service_name);
        }
    }

    // ------------------------------------------------------------------
    // Verification verbs
    // ------------------------------------------------------------------

    /// Forward display context; the worker discovers the user itself
    pub fn setup(&mut self, service_name: &str) {
        self.send_setup(service_name, None);
    }

    /// Forward display context for an already-selected user
    pub fn setup_for_user(&mut self, service_name: &str, username: &str) {
        self.context.select_user(username);
        self.send_setup(service_name, Some(username.to_string()));
    }

    fn send_setup(&mut self, service_name: &str, username: Option<String>) {
        // Selecting a user changes what "default" means; let every
        // interested caller know, not just this conversation.
        self.broadcast_defaults();

        let details = self.context.setup_details();
        let Some(conversation) = self.conversations.get_mut(service_name) else {
            warn!("Tried to set up non-existent conversation {}", service_name);
            return;
        };

        if !conversation.is_connected() {
            conversation.queue_setup(match username {
                Some(username) => QueuedSetup::ForUser(username),
                None => QueuedSetup::Setup,
            });
            return;
        }

        conversation.advance(ConversationState::Setup);
        let verb = match username {
            Some(username) => ControllerVerb::SetupForUser {
                service_name: service_name.to_string(),
                username,
                details,
            },
            None => ControllerVerb::Setup {
                service_name: service_name.to_string(),
                details,
            },
        };
        conversation.send(verb);
    }

    /// Ask the worker to prove the user's identity
    pub fn authenticate(&mut self, service_name: &str) {
        self.forward(
            service_name,
            ConversationState::Authenticating,
            ControllerVerb::Authenticate,
        );
    }

    /// Ask the worker to check login permission
    pub fn authorize(&mut self, service_name: &str) {
        self.forward(
            service_name,
            ConversationState::Authorizing,
            ControllerVerb::Authorize,
        );
    }

    /// Ask the worker to establish (or refresh) session credentials
    pub fn accredit(&mut self, service_name: &str, refresh: bool) {
        let verb = if refresh {
            ControllerVerb::RefreshCredentials
        } else {
            ControllerVerb::EstablishCredentials
        };
        self.forward(service_name, ConversationState::Accrediting, verb);
    }

    /// Ask the worker to open the session with the authentication stack
    pub fn open_session(&mut self, service_name: &str) {
        self.forward(
            service_name,
            ConversationState::SessionOpening,
            ControllerVerb::OpenSession,
        );
    }

    fn forward(&mut self, service_name: &str, state: ConversationState, verb: ControllerVerb) {
        let Some(conversation) = self.conversations.get_mut(service_name) else {
            warn!(
                "Tried to drive non-existent conversation {}",
                service_name
            );
            return;
        };

        conversation.advance(state);
        conversation.send(verb);
    }

    /// Start the session program on the winning conversation.
    ///
    /// Enforces the single-session invariant: refused while another
    /// conversation already owns the session slot; all other conversations
    /// are stopped before the program command goes out.
    pub fn start_session(&mut self, service_name: &str) {
        if let Some(current) = &self.session_conversation {
            warn!(
                "Refusing start_session for {}: session already owned by {}",
                service_name, current
            );
            return;
        }

        if !self.conversations.contains_key(service_name) {
            warn!(
                "Tried to start session of non-existent conversation {}",
                service_name
            );
            return;
        }

        self.stop_all_other_conversations(service_name);

        let environment = self.context.session_environment(&self.config.session);
        let command = self
            .context
            .session_command(&self.config.session)
            .to_string();

        let conversation = self
            .conversations
            .get_mut(service_name)
            .expect("kept conversation present");
        conversation.advance(ConversationState::SessionStarting);

        for (key, value) in environment {
            conversation.send(ControllerVerb::SetEnvironmentVariable { key, value });
        }
        conversation.send(ControllerVerb::StartSession);
        conversation.send(ControllerVerb::StartProgram { command });
    }

    // ------------------------------------------------------------------
    // Selections and queries
    // ------------------------------------------------------------------

    /// Select the user to log in and tell every live conversation
    pub fn select_user(&mut self, username: &str) {
        self.context.select_user(username);
        self.broadcast(ControllerVerb::SetUserName {
            name: username.to_string(),
        });
        self.broadcast_defaults();
    }

    /// Select the session and tell every live conversation; any of the
    /// racing conversations could still win
    pub fn select_session(&mut self, name: &str) {
        self.context.select_session(name);
        self.broadcast(ControllerVerb::SetSessionName {
            name: name.to_string(),
        });
        self.broadcast_defaults();
    }

    /// Select the language and tell every live conversation
    pub fn select_language(&mut self, name: &str) {
        self.context.select_language(name);
        self.broadcast(ControllerVerb::SetLanguageName {
            name: name.to_string(),
        });
        self.broadcast_defaults();
    }

    /// Select an explicit program to run instead of the configured session
    /// command
    pub fn select_program(&mut self, command: &str) {
        self.context.select_program(command);
    }

    /// Record one session environment override
    pub fn set_environment_variable(&mut self, key: &str, value: &str) {
        self.context.set_environment_variable(key, value);
    }

    /// Answer the pending query of a conversation.
    ///
    /// Answering when nothing is pending is a defensive no-op.
    pub fn answer_query(&mut self, service_name: &str, answer: SecretString) {
        let Some(conversation) = self.conversations.get_mut(service_name) else {
            warn!("Tried to answer non-existent conversation {}", service_name);
            return;
        };

        match conversation.take_pending_query() {
            Some(_) => conversation.send(ControllerVerb::Answer { text: answer }),
            None => warn!(
                "Answer for {} with no pending query; ignoring",
                service_name
            ),
        }
    }

    /// Resolve the pending query of a conversation with a cancellation
    pub fn cancel_pending_query(&mut self, service_name: &str) {
        let Some(conversation) = self.conversations.get_mut(service_name) else {
            return;
        };

        if conversation.take_pending_query().is_none() {
            return;
        }

        debug!("Resolving query for {}: {}", service_name, CancelledQuery);
        conversation.send(ControllerVerb::Cancelled);
        self.emit(SessionOutcome::QueryCancelled {
            service_name: service_name.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Event flow
    // ------------------------------------------------------------------

    /// Wait for the next event of this controller's single event stream.
    ///
    /// Returns `None` once the controller has been closed.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.closed {
            return None;
        }

        tokio::select! {
            Some(event) = self.channel_rx.recv() => Some(SessionEvent::Channel(event)),
            Some((service_name, event)) = self.job_rx.recv() => {
                Some(SessionEvent::Job { service_name, event })
            }
            else => None,
        }
    }

    /// Apply one event. The single-subscriber dispatch required by the
    /// concurrency model: never called re-entrantly.
    pub fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Channel(event) => self.handle_channel_event(event),
            SessionEvent::Job {
                service_name,
                event,
            } => self.handle_job_event(service_name, event),
        }
    }

    /// Drain events until the controller is closed and its streams end
    pub async fn run(&mut self) {
        while let Some(event) = self.next_event().await {
            self.dispatch(event);
        }
    }

    /// Stop every conversation, drop the channel server, clear context.
    ///
    /// Idempotent; also safe to call when nothing ever started. After the
    /// first call no further outcome signals are emitted.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }

        debug!("Closing session controller");

        // Resolve pending queries while outcomes may still be emitted, so
        // nobody is left awaiting an answer.
        let services: Vec<String> = self.conversations.keys().cloned().collect();
        for service_name in &services {
            self.cancel_pending_query(service_name);
        }

        self.closed = true;

        for service_name in services {
            if let Some(mut conversation) = self.conversations.remove(&service_name) {
                if let Some(handle) = conversation.detach_connection() {
                    self.authenticated.remove(&handle.id());
                }
                conversation.set_stopping();
                conversation.job_mut().stop_now().await;
            }
        }

        self.pending_connections.clear();
        self.authenticated.clear();

        if let Some(mut server) = self.server.take() {
            server.stop();
        }

        self.context.reset();
        self.session_conversation = None;
        self.session_pid = None;
        self.session_record = None;
    }

    // ------------------------------------------------------------------
    // Event handlers
    // ------------------------------------------------------------------

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { id, peer, handle } => {
                debug!(
                    "Connection {} pending authentication (uid {} pid {:?})",
                    id, peer.uid, peer.pid
                );
                self.pending_connections.insert(id, handle);
            }
            ChannelEvent::Message { id, message } => {
                if let Some(service_name) = self.authenticated.get(&id).cloned() {
                    self.handle_worker_message(service_name, message);
                } else if message == WorkerMessage::Hello {
                    self.register_worker(id);
                } else {
                    warn!(
                        "{}",
                        ProtocolViolation::MessageBeforeHello { connection: id }
                    );
                    self.pending_connections.remove(&id);
                }
            }
            ChannelEvent::Disconnected { id } => {
                self.pending_connections.remove(&id);

                let Some(service_name) = self.authenticated.remove(&id) else {
                    return;
                };
                let Some(conversation) = self.conversations.get_mut(&service_name) else {
                    return;
                };

                let cancelled_query = conversation.take_pending_query().is_some();
                conversation.detach_connection();

                if !conversation.is_stopping() {
                    warn!("Channel to worker {} closed unexpectedly", service_name);
                }
                if cancelled_query {
                    self.emit(SessionOutcome::QueryCancelled { service_name });
                }
            }
        }
    }

    /// Authenticate a pending connection against a conversation by the
    /// OS-reported pid of the connecting peer.
    fn register_worker(&mut self, id: ConnectionId) {
        let Some(handle) = self.pending_connections.remove(&id) else {
            debug!("Ignoring hello from connection {} we are not tracking", id);
            return;
        };

        let peer_pid = handle.peer().pid;
        let matched = peer_pid.and_then(|pid| {
            self.conversations
                .values()
                .find(|conversation| {
                    !conversation.is_stopping()
                        && !conversation.is_connected()
                        && conversation.worker_pid() == Some(pid)
                })
                .map(|conversation| conversation.service_name().to_string())
        });

        let Some(service_name) = matched else {
            warn!("{}", ProtocolViolation::UnknownPeer { pid: peer_pid });
            handle.send(ControllerVerb::AccessDenied {
                message: "connection is not from a known conversation".to_string(),
            });
            // Dropping the handle closes the connection after the rejection
            // flushed.
            return;
        };

        info!("Worker for {} connected (pid {:?})", service_name, peer_pid);

        let conversation = self
            .conversations
            .get_mut(&service_name)
            .expect("matched conversation present");
        conversation.attach_connection(handle);
        conversation.advance(ConversationState::Connected);
        conversation.send(ControllerVerb::StartConversation);
        self.authenticated.insert(id, service_name.clone());

        self.emit(SessionOutcome::ConversationStarted {
            service_name: service_name.clone(),
        });

        let queued = self
            .conversations
            .get_mut(&service_name)
            .and_then(|conversation| conversation.take_queued_setup());
        match queued {
            Some(QueuedSetup::Setup) => self.setup(&service_name),
            Some(QueuedSetup::ForUser(username)) => {
                self.setup_for_user(&service_name, &username)
            }
            None => {}
        }
    }

    fn handle_worker_message(&mut self, service_name: String, message: WorkerMessage) {
        match message {
            WorkerMessage::Hello => {
                warn!("Duplicate hello from worker {}; ignoring", service_name);
            }
            WorkerMessage::ServiceUnavailable { message } => {
                self.emit(SessionOutcome::ServiceUnavailable {
                    service_name: service_name.clone(),
                    message: message.clone(),
                });
                self.emit(SessionOutcome::VerificationFailed {
                    service_name: service_name.clone(),
                    error: VerificationError::ServiceUnavailable { message },
                });
                self.stop_conversation(&service_name);
            }
            WorkerMessage::SetupComplete => {
                self.emit(SessionOutcome::SetupComplete { service_name });
            }
            WorkerMessage::SetupFailed { message } => {
                self.emit(SessionOutcome::SetupFailed {
                    service_name: service_name.clone(),
                    message,
                });
                self.stop_conversation(&service_name);
            }
            WorkerMessage::Authenticated => {
                if self.advance(&service_name, ConversationState::Authenticated) {
                    self.emit(SessionOutcome::Authenticated { service_name });
                }
            }
            WorkerMessage::AuthenticationFailed { message } => {
                self.emit(SessionOutcome::AuthenticationFailed {
                    service_name: service_name.clone(),
                    message,
                });
                self.report_failed_attempt(&service_name);
                self.stop_conversation(&service_name);
            }
            WorkerMessage::Authorized => {
                if self.advance(&service_name, ConversationState::Authorized) {
                    self.emit(SessionOutcome::Authorized { service_name });
                }
            }
            WorkerMessage::AuthorizationFailed { message } => {
                self.emit(SessionOutcome::AuthorizationFailed {
                    service_name: service_name.clone(),
                    message,
                });
                self.stop_conversation(&service_name);
            }
            WorkerMessage::Accredited => {
                if self.advance(&service_name, ConversationState::Accredited) {
                    self.emit(SessionOutcome::Accredited { service_name });
                }
            }
            WorkerMessage::AccreditationFailed { message } => {
                self.emit(SessionOutcome::AccreditationFailed {
                    service_name: service_name.clone(),
                    message,
                });
                self.stop_conversation(&service_name);
            }
            WorkerMessage::Opened { session_id } => {
                if self.advance(&service_name, ConversationState::SessionOpened) {
                    self.emit(SessionOutcome::SessionOpened {
                        service_name,
                        session_id,
                    });
                }
            }
            WorkerMessage::OpenFailed { message } => {
                self.emit(SessionOutcome::SessionOpenFailed {
                    service_name: service_name.clone(),
                    message,
                });
                self.stop_conversation(&service_name);
            }
            WorkerMessage::SessionStarted { pid } => {
                if self.advance(&service_name, ConversationState::SessionStarted) {
                    info!("Session started for {} with pid {}", service_name, pid);
                    self.session_conversation = Some(service_name.clone());
                    self.session_pid = Some(pid);
                    self.report_login(&service_name, pid);
                    self.emit(SessionOutcome::SessionStarted { service_name, pid });
                }
            }
            WorkerMessage::SessionStartFailed { message } => {
                self.emit(SessionOutcome::SessionStartFailed {
                    service_name: service_name.clone(),
                    message,
                });
                self.stop_conversation(&service_name);
            }
            WorkerMessage::SessionExited { status } => {
                if self.session_conversation.as_deref() == Some(service_name.as_str()) {
                    info!("Session for {} exited with status {}", service_name, status);
                    self.advance(&service_name, ConversationState::SessionExited);
                    self.report_logout();
                    self.session_conversation = None;
                    self.session_pid = None;
                    self.emit(SessionOutcome::SessionExited { status });
                }
            }
            WorkerMessage::SessionDied { signal } => {
                if self.session_conversation.as_deref() == Some(service_name.as_str()) {
                    warn!("Session for {} died from signal {}", service_name, signal);
                    self.advance(&service_name, ConversationState::SessionDied);
                    self.report_logout();
                    self.session_conversation = None;
                    self.session_pid = None;
                    self.emit(SessionOutcome::SessionDied { signal });
                }
            }
            WorkerMessage::UsernameChanged { username } => {
                debug!(
                    "Worker for {} reports username {:?}",
                    service_name, username
                );
                self.context.select_user(&username);
                self.emit(SessionOutcome::UsernameChanged {
                    service_name,
                    username,
                });
                self.broadcast_defaults();
            }
            WorkerMessage::Info { text } => {
                self.emit(SessionOutcome::Info { service_name, text });
            }
            WorkerMessage::Problem { text } => {
                self.emit(SessionOutcome::Problem { service_name, text });
            }
            WorkerMessage::InfoQuery { prompt } => {
                self.handle_query(service_name, prompt, false);
            }
            WorkerMessage::SecretInfoQuery { prompt } => {
                self.handle_query(service_name, prompt, true);
            }
            WorkerMessage::CancelPendingQuery => {
                self.cancel_pending_query(&service_name);
            }
        }
    }

    fn handle_query(&mut self, service_name: String, prompt: String, secret: bool) {
        let Some(conversation) = self.conversations.get_mut(&service_name) else {
            return;
        };

        let accepted = conversation.set_pending_query(PendingQuery {
            prompt: prompt.clone(),
            secret,
        });
        if !accepted {
            // The first caller's prompt stays live; the duplicate is a
            // protocol violation answered by ignoring it.
            warn!(
                "{}",
                ProtocolViolation::QueryAlreadyPending {
                    service: service_name.clone()
                }
            );
            return;
        }

        if secret {
            self.emit(SessionOutcome::SecretInfoQuery {
                service_name,
                prompt,
            });
        } else {
            self.emit(SessionOutcome::InfoQuery {
                service_name,
                prompt,
            });
        }
    }

    fn handle_job_event(&mut self, service_name: String, event: JobEvent) {
        match event {
            JobEvent::Started => {
                debug!("Worker job for {} started", service_name);
            }
            JobEvent::Exited(code) => {
                debug!("Worker job for {} exited: {}", service_name, code);
                self.handle_worker_termination(service_name, Ok(code));
            }
            JobEvent::Died(signal) => {
                debug!("Worker job for {} died: {}", service_name, signal);
                self.handle_worker_termination(service_name, Err(signal));
            }
        }
    }

    /// Finalize a conversation whose worker process is gone.
    ///
    /// The classification here is load-bearing: a worker lost before the
    /// conversation reached the authenticated state is a failed login
    /// (retryable), a worker lost after its session started is a crashed
    /// session. The two must never be confused.
    fn handle_worker_termination(&mut self, service_name: String, status: Result<i32, i32>) {
        let Some(mut conversation) = self.conversations.remove(&service_name) else {
            // Already finalized, e.g. replaced by a fresh conversation.
            return;
        };

        let cancelled_query = conversation.take_pending_query().is_some();
        if cancelled_query {
            conversation.send(ControllerVerb::Cancelled);
        }

        if let Some(handle) = conversation.detach_connection() {
            self.authenticated.remove(&handle.id());
        }

        let was_session = self.session_conversation.as_deref() == Some(service_name.as_str());
        let reached_authenticated = conversation.state().reached_authenticated();
        let was_stopping = conversation.is_stopping();

        if !was_stopping {
            conversation.set_stopping();
        }
        conversation.advance(ConversationState::Terminated);

        if cancelled_query {
            self.emit(SessionOutcome::QueryCancelled {
                service_name: service_name.clone(),
            });
        }

        if was_session {
            self.session_conversation = None;
            self.session_pid = None;

            if was_stopping {
                info!("Session conversation {} stopped", service_name);
                self.report_logout();
                self.emit(SessionOutcome::SessionStopped {
                    service_name: service_name.clone(),
                });
            } else {
                let crash = match status {
                    Ok(code) => SessionCrash::Exited(code),
                    Err(signal) => SessionCrash::Died(signal),
                };
                error!("Abnormal session end for {}: {}", service_name, crash);
                self.report_logout();
                match crash {
                    SessionCrash::Exited(status) => {
                        self.emit(SessionOutcome::SessionExited { status });
                    }
                    SessionCrash::Died(signal) => {
                        self.emit(SessionOutcome::SessionDied { signal });
                    }
                }
            }
        } else if !was_stopping && !reached_authenticated {
            let error = match status {
                Ok(code) => VerificationError::WorkerExited { code },
                Err(signal) => VerificationError::WorkerDied { signal },
            };
            warn!("Verification failed for {}: {}", service_name, error);
            self.report_failed_attempt(&service_name);
            self.emit(SessionOutcome::VerificationFailed {
                service_name: service_name.clone(),
                error,
            });
        }

        self.emit(SessionOutcome::ConversationStopped { service_name });
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn advance(&mut self, service_name: &str, state: ConversationState) -> bool {
        self.conversations
            .get_mut(service_name)
            .map(|conversation| conversation.advance(state))
            .unwrap_or(false)
    }

    fn broadcast(&mut self, verb: ControllerVerb) {
        for conversation in self.conversations.values() {
            if conversation.is_connected() && !conversation.is_stopping() {
                conversation.send(verb.clone());
            }
        }
    }

    fn broadcast_defaults(&mut self) {
        let session = self
            .context
            .session_name(&self.config.session)
            .to_string();
        let language = self
            .context
            .language_name(&self.config.session)
            .to_string();

        self.emit(SessionOutcome::DefaultSessionChanged { name: session });
        self.emit(SessionOutcome::DefaultLanguageChanged { name: language });
    }

    fn emit(&self, outcome: SessionOutcome) {
        if self.closed {
            return;
        }
        let _ = self.outcomes.send(outcome);
    }

    fn report_login(&mut self, service_name: &str, pid: i32) {
        let mut record = SessionRecord::new(service_name);
        record.username = self.context.selected_user().map(str::to_string);
        record.display_name = self.context.display_name.clone();
        record.display_hostname = self.context.display_hostname.clone();
        record.display_device = self.context.display_device.clone();
        record.session_pid = Some(pid);

        self.session_record = Some(record.clone());

        let sink = Arc::clone(&self.record);
        tokio::spawn(async move {
            sink.login(&record).await;
        });
    }

    fn report_logout(&mut self) {
        let Some(mut record) = self.session_record.take() else {
            return;
        };
        record.timestamp = chrono::Utc::now();

        let sink = Arc::clone(&self.record);
        tokio::spawn(async move {
            sink.logout(&record).await;
        });
    }

    fn report_failed_attempt(&mut self, service_name: &str) {
        let mut record = SessionRecord::new(service_name);
        record.username = self.context.selected_user().map(str::to_string);
        record.display_name = self.context.display_name.clone();
        record.display_hostname = self.context.display_hostname.clone();
        record.display_device = self.context.display_device.clone();

        let sink = Arc::clone(&self.record);
        tokio::spawn(async move {
            sink.failed_attempt(&record).await;
        });
    }
}

fn worker_binary_name(command: &str) -> &str {
    command
        .split_whitespace()
        .next()
        .and_then(|path| path.rsplit('/').next())
        .unwrap_or("worker")
}

#[cfg(test)]
impl SessionController {
    /// Hand the controller a pre-credentialed connection, bypassing the
    /// unix listener so tests can fabricate the peer pid.
    fn inject_connection(
        &mut self,
        stream: tokio::net::UnixStream,
        peer: crate::channel::PeerCredentials,
    ) {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT_TEST_CONNECTION: AtomicU64 = AtomicU64::new(1 << 32);

        let id = NEXT_TEST_CONNECTION.fetch_add(1, Ordering::Relaxed);
        let connection =
            crate::channel::connection::spawn_connection(stream, id, peer, self.channel_tx.clone());
        let _ = self.channel_tx.send(ChannelEvent::Connected {
            id,
            peer,
            handle: connection.handle,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::protocol::{self, SecretString};
    use crate::channel::PeerCredentials;
    use futures::{SinkExt, StreamExt};
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use tokio::net::UnixStream;
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn test_config(dir: &std::path::Path) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.worker.command = "sleep 30".to_string();
        config.worker.stop_timeout_secs = 2;
        config.channel.socket_dir = dir.to_path_buf();
        config.channel.allowed_uid = nix::unistd::getuid().as_raw();
        config.record.enabled = false;
        config
    }

    fn new_controller() -> (
        SessionController,
        mpsc::UnboundedReceiver<SessionOutcome>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (controller, outcomes) = SessionController::new(Arc::new(config)).unwrap();
        (controller, outcomes, dir)
    }

    /// Process queued events until the controller has been quiet for a bit.
    async fn pump(controller: &mut SessionController) {
        loop {
            match tokio::time::timeout(Duration::from_millis(250), controller.next_event()).await
            {
                Ok(Some(event)) => controller.dispatch(event),
                Ok(None) | Err(_) => break,
            }
        }
    }

    fn drain(outcomes: &mut mpsc::UnboundedReceiver<SessionOutcome>) -> Vec<SessionOutcome> {
        let mut collected = Vec::new();
        while let Ok(outcome) = outcomes.try_recv() {
            collected.push(outcome);
        }
        collected
    }

    /// The worker end of an injected channel connection.
    struct FakeWorker {
        reader: FramedRead<tokio::net::unix::OwnedReadHalf, tokio_util::codec::LengthDelimitedCodec>,
        writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, tokio_util::codec::LengthDelimitedCodec>,
    }

    impl FakeWorker {
        fn connect(controller: &mut SessionController, pid: i32) -> Self {
            let (server_end, client_end) = UnixStream::pair().unwrap();
            controller.inject_connection(
                server_end,
                PeerCredentials {
                    uid: 0,
                    gid: 0,
                    pid: Some(pid),
                },
            );

            let (read_half, write_half) = client_end.into_split();
            Self {
                reader: FramedRead::new(read_half, protocol::frame_codec()),
                writer: FramedWrite::new(write_half, protocol::frame_codec()),
            }
        }

        async fn send(&mut self, message: WorkerMessage) {
            self.writer
                .send(protocol::encode_message(&message).unwrap())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<ControllerVerb> {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.reader.next())
                .await
                .ok()??
                .ok()?;
            protocol::decode_message(&frame).ok()
        }
    }

    /// Attach a fake worker to a started conversation and complete hello.
    async fn connect_worker(
        controller: &mut SessionController,
        service_name: &str,
    ) -> FakeWorker {
        let pid = controller.conversations[service_name].worker_pid().unwrap();
        let mut worker = FakeWorker::connect(controller, pid);
        worker.send(WorkerMessage::Hello).await;
        pump(controller).await;
        assert_eq!(worker.recv().await, Some(ControllerVerb::StartConversation));
        worker
    }

    /// Drive a connected conversation through the whole verification flow.
    async fn verify_conversation(
        controller: &mut SessionController,
        worker: &mut FakeWorker,
        service_name: &str,
    ) {
        controller.setup(service_name);
        assert!(matches!(
            worker.recv().await,
            Some(ControllerVerb::Setup { .. })
        ));
        worker.send(WorkerMessage::SetupComplete).await;
        pump(controller).await;

        controller.authenticate(service_name);
        assert_eq!(worker.recv().await, Some(ControllerVerb::Authenticate));
        worker.send(WorkerMessage::Authenticated).await;
        pump(controller).await;

        controller.authorize(service_name);
        assert_eq!(worker.recv().await, Some(ControllerVerb::Authorize));
        worker.send(WorkerMessage::Authorized).await;
        pump(controller).await;

        controller.accredit(service_name, false);
        assert_eq!(
            worker.recv().await,
            Some(ControllerVerb::EstablishCredentials)
        );
        worker.send(WorkerMessage::Accredited).await;
        pump(controller).await;

        controller.open_session(service_name);
        assert_eq!(worker.recv().await, Some(ControllerVerb::OpenSession));
        worker
            .send(WorkerMessage::Opened { session_id: None })
            .await;
        pump(controller).await;
    }

    #[tokio::test]
    async fn test_full_login_flow_stops_the_losing_conversation() {
        let (mut controller, mut outcomes, _dir) = new_controller();

        controller.start_conversation("password").await.unwrap();
        controller.start_conversation("smartcard").await.unwrap();
        pump(&mut controller).await;

        let mut worker = connect_worker(&mut controller, "password").await;
        assert!(drain(&mut outcomes).contains(&SessionOutcome::ConversationStarted {
            service_name: "password".to_string(),
        }));

        verify_conversation(&mut controller, &mut worker, "password").await;
        assert_eq!(
            controller.conversation_state("password"),
            Some(ConversationState::SessionOpened)
        );

        controller.select_session("sway");
        controller.start_session("password");

        // Environment goes out ahead of the program command.
        let mut saw_desktop_session = false;
        loop {
            match worker.recv().await {
                Some(ControllerVerb::SetEnvironmentVariable { key, value }) => {
                    if key == "DESKTOP_SESSION" {
                        assert_eq!(value, "sway");
                        saw_desktop_session = true;
                    }
                }
                Some(ControllerVerb::SetSessionName { name }) => assert_eq!(name, "sway"),
                Some(ControllerVerb::StartSession) => {}
                Some(ControllerVerb::StartProgram { command }) => {
                    assert_eq!(command, "/usr/libexec/lucid-session-runner");
                    break;
                }
                other => panic!("unexpected verb before StartProgram: {:?}", other),
            }
        }
        assert!(saw_desktop_session);

        worker.send(WorkerMessage::SessionStarted { pid: 4242 }).await;
        pump(&mut controller).await;

        assert_eq!(controller.session_pid(), Some(4242));
        assert_eq!(controller.session_service(), Some("password"));

        // The losing conversation's worker was signaled and reaped.
        assert!(!controller.has_conversation("smartcard"));
        let collected = drain(&mut outcomes);
        assert!(collected.contains(&SessionOutcome::SessionStarted {
            service_name: "password".to_string(),
            pid: 4242,
        }));
        assert!(collected.contains(&SessionOutcome::ConversationStopped {
            service_name: "smartcard".to_string(),
        }));
        // A stopped conversation never reads as a started session.
        assert!(!collected
            .iter()
            .any(|outcome| matches!(outcome, SessionOutcome::SessionStarted { service_name, .. } if service_name == "smartcard")));

        controller.close().await;
    }

    #[tokio::test]
    async fn test_second_start_session_is_rejected() {
        let (mut controller, mut _outcomes, _dir) = new_controller();

        controller.start_conversation("password").await.unwrap();
        controller.start_conversation("smartcard").await.unwrap();
        pump(&mut controller).await;

        let mut card = connect_worker(&mut controller, "smartcard").await;
        verify_conversation(&mut controller, &mut card, "smartcard").await;

        controller.start_session("smartcard");
        card.send(WorkerMessage::SessionStarted { pid: 7 }).await;
        pump(&mut controller).await;
        assert_eq!(controller.session_service(), Some("smartcard"));

        // The password conversation lost the race and is already draining.
        pump(&mut controller).await;
        assert!(!controller.has_conversation("password"));

        controller.start_session("password");
        assert_eq!(controller.session_service(), Some("smartcard"));
        assert_eq!(controller.session_pid(), Some(7));

        controller.close().await;
    }

    #[tokio::test]
    async fn test_worker_death_cancels_pending_query() {
        let (mut controller, mut outcomes, _dir) = new_controller();

        controller.start_conversation("password").await.unwrap();
        pump(&mut controller).await;

        let mut worker = connect_worker(&mut controller, "password").await;
        worker
            .send(WorkerMessage::InfoQuery {
                prompt: "Password:".to_string(),
            })
            .await;
        pump(&mut controller).await;

        assert!(drain(&mut outcomes).contains(&SessionOutcome::InfoQuery {
            service_name: "password".to_string(),
            prompt: "Password:".to_string(),
        }));

        // The worker process dies before anyone answers.
        let pid = controller.conversations["password"].worker_pid().unwrap();
        kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
        pump(&mut controller).await;

        let collected = drain(&mut outcomes);
        assert!(collected.contains(&SessionOutcome::QueryCancelled {
            service_name: "password".to_string(),
        }));
        assert!(collected.iter().any(|outcome| matches!(
            outcome,
            SessionOutcome::VerificationFailed {
                service_name,
                error: VerificationError::WorkerDied { .. },
            } if service_name == "password"
        )));
        // Pre-authentication death is a login failure, never a session crash.
        assert!(!collected
            .iter()
            .any(|outcome| matches!(outcome, SessionOutcome::SessionDied { .. })));
        assert!(!controller.has_conversation("password"));

        controller.close().await;
    }

    #[tokio::test]
    async fn test_unknown_peer_is_rejected_on_the_real_socket() {
        let (mut controller, mut outcomes, _dir) = new_controller();

        controller.start_conversation("password").await.unwrap();
        pump(&mut controller).await;
        drain(&mut outcomes);

        // Connect as ourselves; our pid matches no worker job.
        let stream = UnixStream::connect(controller.server_address()).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut outgoing = FramedWrite::new(write_half, protocol::frame_codec());
        let mut incoming = FramedRead::new(read_half, protocol::frame_codec());

        outgoing
            .send(protocol::encode_message(&WorkerMessage::Hello).unwrap())
            .await
            .unwrap();
        pump(&mut controller).await;

        let frame = tokio::time::timeout(Duration::from_secs(2), incoming.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let verb: ControllerVerb = protocol::decode_message(&frame).unwrap();
        assert!(matches!(verb, ControllerVerb::AccessDenied { .. }));

        // The rejection is followed by the connection closing.
        assert!(tokio::time::timeout(Duration::from_secs(2), incoming.next())
            .await
            .unwrap()
            .is_none());

        // No conversation state changed.
        assert_eq!(
            controller.conversation_state("password"),
            Some(ConversationState::Created)
        );
        assert!(drain(&mut outcomes).is_empty());

        controller.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_start_conversation_is_ignored() {
        let (mut controller, _outcomes, _dir) = new_controller();

        controller.start_conversation("password").await.unwrap();
        pump(&mut controller).await;
        let pid = controller.conversations["password"].worker_pid();

        controller.start_conversation("password").await.unwrap();
        pump(&mut controller).await;

        assert_eq!(controller.conversations.len(), 1);
        assert_eq!(controller.conversations["password"].worker_pid(), pid);

        controller.close().await;
    }

    #[tokio::test]
    async fn test_second_query_is_rejected_and_first_stays_answerable() {
        let (mut controller, mut outcomes, _dir) = new_controller();

        controller.start_conversation("password").await.unwrap();
        pump(&mut controller).await;
        let mut worker = connect_worker(&mut controller, "password").await;
        drain(&mut outcomes);

        worker
            .send(WorkerMessage::SecretInfoQuery {
                prompt: "Password:".to_string(),
            })
            .await;
        worker
            .send(WorkerMessage::InfoQuery {
                prompt: "Token:".to_string(),
            })
            .await;
        pump(&mut controller).await;

        let collected = drain(&mut outcomes);
        assert_eq!(
            collected,
            vec![SessionOutcome::SecretInfoQuery {
                service_name: "password".to_string(),
                prompt: "Password:".to_string(),
            }]
        );

        controller.answer_query("password", SecretString::new("hunter2"));
        match worker.recv().await {
            Some(ControllerVerb::Answer { text }) => assert_eq!(text.expose(), "hunter2"),
            other => panic!("expected Answer, got {:?}", other),
        }

        // With the first query resolved, the worker may ask again.
        worker
            .send(WorkerMessage::InfoQuery {
                prompt: "Token:".to_string(),
            })
            .await;
        pump(&mut controller).await;
        assert!(drain(&mut outcomes).contains(&SessionOutcome::InfoQuery {
            service_name: "password".to_string(),
            prompt: "Token:".to_string(),
        }));

        controller.close().await;
    }

    #[tokio::test]
    async fn test_stop_conversation_resolves_query_before_closing() {
        let (mut controller, mut outcomes, _dir) = new_controller();

        controller.start_conversation("password").await.unwrap();
        pump(&mut controller).await;
        let mut worker = connect_worker(&mut controller, "password").await;
        drain(&mut outcomes);

        worker
            .send(WorkerMessage::InfoQuery {
                prompt: "Password:".to_string(),
            })
            .await;
        pump(&mut controller).await;

        controller.stop_conversation("password");

        // The cancellation is flushed to the worker before the channel goes.
        assert_eq!(worker.recv().await, Some(ControllerVerb::Cancelled));
        assert_eq!(worker.recv().await, None);

        pump(&mut controller).await;
        let collected = drain(&mut outcomes);
        assert!(collected.contains(&SessionOutcome::QueryCancelled {
            service_name: "password".to_string(),
        }));
        assert!(collected.contains(&SessionOutcome::ConversationStopped {
            service_name: "password".to_string(),
        }));

        controller.close().await;
    }

    #[tokio::test]
    async fn test_answering_with_no_pending_query_is_a_noop() {
        let (mut controller, _outcomes, _dir) = new_controller();

        controller.start_conversation("password").await.unwrap();
        pump(&mut controller).await;
        let _worker = connect_worker(&mut controller, "password").await;

        controller.answer_query("password", SecretString::new("nothing asked"));
        controller.cancel_pending_query("password");

        assert!(controller.has_conversation("password"));
        controller.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut controller, mut outcomes, _dir) = new_controller();

        controller.start_conversation("password").await.unwrap();
        controller.start_conversation("smartcard").await.unwrap();
        pump(&mut controller).await;

        let mut worker = connect_worker(&mut controller, "password").await;
        worker
            .send(WorkerMessage::InfoQuery {
                prompt: "Password:".to_string(),
            })
            .await;
        pump(&mut controller).await;
        drain(&mut outcomes);

        controller.close().await;
        assert!(controller.is_closed());
        assert!(!controller.has_conversation("password"));
        assert!(!controller.has_conversation("smartcard"));

        // The pending query was resolved, but teardown emits no further
        // outcome signals.
        let collected = drain(&mut outcomes);
        assert!(collected.contains(&SessionOutcome::QueryCancelled {
            service_name: "password".to_string(),
        }));
        assert!(!collected
            .iter()
            .any(|outcome| matches!(outcome, SessionOutcome::ConversationStopped { .. })));

        controller.close().await;
        assert!(controller.is_closed());
        assert!(drain(&mut outcomes).is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_service_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.worker.command = "/nonexistent/lucid-session-worker".to_string();
        let (mut controller, mut outcomes) = SessionController::new(Arc::new(config)).unwrap();

        assert!(controller.start_conversation("password").await.is_err());
        assert!(!controller.has_conversation("password"));
        assert!(drain(&mut outcomes).iter().any(|outcome| matches!(
            outcome,
            SessionOutcome::ServiceUnavailable { service_name, .. } if service_name == "password"
        )));

        controller.close().await;
    }

    #[tokio::test]
    async fn test_selections_are_broadcast_to_live_conversations() {
        let (mut controller, _outcomes, _dir) = new_controller();

        controller.start_conversation("password").await.unwrap();
        pump(&mut controller).await;
        let mut worker = connect_worker(&mut controller, "password").await;

        controller.select_session("plasma");
        controller.select_language("de_DE.UTF-8");
        controller.select_user("joe");

        assert_eq!(
            worker.recv().await,
            Some(ControllerVerb::SetSessionName {
                name: "plasma".to_string()
            })
        );
        assert_eq!(
            worker.recv().await,
            Some(ControllerVerb::SetLanguageName {
                name: "de_DE.UTF-8".to_string()
            })
        );
        assert_eq!(
            worker.recv().await,
            Some(ControllerVerb::SetUserName {
                name: "joe".to_string()
            })
        );

        controller.close().await;
    }
}
