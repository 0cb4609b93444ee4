//! Authentication Conversations
//!
//! A conversation binds exactly one worker job to exactly one authenticated
//! channel connection and tracks the fixed verification state machine for
//! it. Conversations are plain data owned by the session controller; every
//! mutation happens on the controller's single event flow.

use tracing::{debug, warn};

use crate::channel::{ConnectionHandle, ControllerVerb};

use super::worker_job::WorkerJob;

/// Strict forward progression of one authentication attempt.
///
/// `Stopping` is reachable from any state and leads to `Terminated`; there
/// are no other cycles; retrying means tearing the conversation down and
/// starting a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConversationState {
    /// Worker spawned, not yet dialed back in
    Created,
    /// Channel connection authenticated by worker pid
    Connected,
    /// Display context forwarded
    Setup,
    /// Waiting for the worker to prove identity
    Authenticating,
    /// Identity proven
    Authenticated,
    /// Waiting for the login permission check
    Authorizing,
    /// Login permitted
    Authorized,
    /// Waiting for credentials to be established
    Accrediting,
    /// Credentials established
    Accredited,
    /// Waiting for the session to open
    SessionOpening,
    /// Session opened with the authentication stack
    SessionOpened,
    /// Waiting for the session program to start
    SessionStarting,
    /// The session program is running
    SessionStarted,
    /// The session program exited on its own
    SessionExited,
    /// The session program was killed
    SessionDied,
    /// Teardown requested
    Stopping,
    /// Worker gone and channel closed
    Terminated,
}

impl ConversationState {
    /// Whether `next` is a legal successor of `self`
    pub fn allows(self, next: ConversationState) -> bool {
        use ConversationState::*;

        // Teardown wins from anywhere.
        if next == Stopping {
            return self != Terminated;
        }
        if next == Terminated {
            return true;
        }

        matches!(
            (self, next),
            (Created, Connected)
                | (Connected, Setup)
                | (Setup, Authenticating)
                | (Authenticating, Authenticated)
                | (Authenticated, Authorizing)
                | (Authorizing, Authorized)
                | (Authorized, Accrediting)
                | (Accrediting, Accredited)
                | (Accredited, SessionOpening)
                | (SessionOpening, SessionOpened)
                | (SessionOpened, SessionStarting)
                | (SessionStarting, SessionStarted)
                | (SessionStarted, SessionExited)
                | (SessionStarted, SessionDied)
        )
    }

    /// Whether the conversation got at least as far as proving identity
    pub fn reached_authenticated(self) -> bool {
        use ConversationState::*;
        matches!(
            self,
            Authenticated
                | Authorizing
                | Authorized
                | Accrediting
                | Accredited
                | SessionOpening
                | SessionOpened
                | SessionStarting
                | SessionStarted
                | SessionExited
                | SessionDied
        )
    }
}

/// The single outstanding interactive prompt of a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuery {
    /// Prompt text, relayed verbatim to the user
    pub prompt: String,
    /// Whether the answer must not be echoed or logged
    pub secret: bool,
}

/// Display context queued before the worker has dialed back in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedSetup {
    /// Plain setup; the worker discovers the user itself
    Setup,
    /// Setup for an already-selected user
    ForUser(String),
}

/// One in-progress authentication attempt, keyed by service name.
pub struct Conversation {
    service_name: String,
    job: WorkerJob,
    connection: Option<ConnectionHandle>,
    state: ConversationState,
    pending_query: Option<PendingQuery>,
    queued_setup: Option<QueuedSetup>,
    is_stopping: bool,
}

impl Conversation {
    /// Create a conversation around a spawned (or about-to-spawn) job
    pub fn new(service_name: impl Into<String>, job: WorkerJob) -> Self {
        Self {
            service_name: service_name.into(),
            job,
            connection: None,
            state: ConversationState::Created,
            pending_query: None,
            queued_setup: None,
            is_stopping: false,
        }
    }

    /// Service name identifying this conversation
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The owned worker job
    pub fn job(&self) -> &WorkerJob {
        &self.job
    }

    /// The owned worker job, mutably
    pub fn job_mut(&mut self) -> &mut WorkerJob {
        &mut self.job
    }

    /// Pid of the worker process, used to match the hello handshake
    pub fn worker_pid(&self) -> Option<i32> {
        self.job.pid()
    }

    /// Current state
    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// Whether teardown has been requested
    pub fn is_stopping(&self) -> bool {
        self.is_stopping
    }

    /// Mark the conversation as draining; later worker termination events
    /// are expected rather than protocol errors
    pub fn set_stopping(&mut self) {
        self.is_stopping = true;
        self.state = ConversationState::Stopping;
    }

    /// Advance the state machine, refusing illegal jumps.
    ///
    /// Returns whether the transition was taken; an illegal transition is
    /// logged and ignored so a confused worker cannot wedge the controller.
    pub fn advance(&mut self, next: ConversationState) -> bool {
        if !self.state.allows(next) {
            warn!(
                "Conversation {}: refusing transition {:?} -> {:?}",
                self.service_name, self.state, next
            );
            return false;
        }

        debug!(
            "Conversation {}: {:?} -> {:?}",
            self.service_name, self.state, next
        );
        self.state = next;
        true
    }

    /// Whether the worker has authenticated its channel connection
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Attach the authenticated channel connection
    pub fn attach_connection(&mut self, connection: ConnectionHandle) {
        self.connection = Some(connection);
    }

    /// Drop the channel connection, closing it once queued verbs flushed
    pub fn detach_connection(&mut self) -> Option<ConnectionHandle> {
        self.connection.take()
    }

    /// Send a verb to the worker; dropped with a log when not connected
    pub fn send(&self, verb: ControllerVerb) {
        match &self.connection {
            Some(connection) => connection.send(verb),
            None => debug!(
                "Conversation {}: dropping verb for unconnected worker",
                self.service_name
            ),
        }
    }

    /// Queue display context delivery until the worker dials in
    pub fn queue_setup(&mut self, setup: QueuedSetup) {
        self.queued_setup = Some(setup);
    }

    /// Take the queued display context, if any
    pub fn take_queued_setup(&mut self) -> Option<QueuedSetup> {
        self.queued_setup.take()
    }

    /// Whether an interactive prompt is outstanding
    pub fn has_pending_query(&self) -> bool {
        self.pending_query.is_some()
    }

    /// Record the single pending query.
    ///
    /// A second query while one is outstanding is refused, never silently
    /// overwritten: the first caller's prompt stays live and the duplicate
    /// is reported back as `false`.
    pub fn set_pending_query(&mut self, query: PendingQuery) -> bool {
        if self.pending_query.is_some() {
            warn!(
                "Conversation {}: rejecting second query while one is pending",
                self.service_name
            );
            return false;
        }

        self.pending_query = Some(query);
        true
    }

    /// Resolve the pending query, returning it to the caller
    pub fn take_pending_query(&mut self) -> Option<PendingQuery> {
        self.pending_query.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn conversation() -> Conversation {
        Conversation::new("password", WorkerJob::new("true", Duration::from_secs(5)))
    }

    const FORWARD_ORDER: [ConversationState; 13] = [
        ConversationState::Created,
        ConversationState::Connected,
        ConversationState::Setup,
        ConversationState::Authenticating,
        ConversationState::Authenticated,
        ConversationState::Authorizing,
        ConversationState::Authorized,
        ConversationState::Accrediting,
        ConversationState::Accredited,
        ConversationState::SessionOpening,
        ConversationState::SessionOpened,
        ConversationState::SessionStarting,
        ConversationState::SessionStarted,
    ];

    #[test]
    fn test_full_forward_progression() {
        let mut conv = conversation();

        for state in FORWARD_ORDER.into_iter().skip(1) {
            assert!(conv.advance(state), "expected {:?} to be legal", state);
        }

        assert!(conv.advance(ConversationState::SessionExited));
    }

    #[test]
    fn test_no_skipping_steps() {
        let mut conv = conversation();
        assert!(!conv.advance(ConversationState::Authenticated));
        assert_eq!(conv.state(), ConversationState::Created);
    }

    #[test]
    fn test_stopping_reachable_from_anywhere() {
        for (i, _) in FORWARD_ORDER.iter().enumerate() {
            let mut conv = conversation();
            for state in FORWARD_ORDER.into_iter().take(i + 1).skip(1) {
                conv.advance(state);
            }

            conv.set_stopping();
            assert!(conv.is_stopping());
            assert_eq!(conv.state(), ConversationState::Stopping);
            assert!(conv.advance(ConversationState::Terminated));
        }
    }

    #[test]
    fn test_terminated_is_final() {
        let mut conv = conversation();
        conv.set_stopping();
        assert!(conv.advance(ConversationState::Terminated));
        assert!(!conv.advance(ConversationState::Stopping));
        assert!(!conv.advance(ConversationState::Connected));
    }

    #[test]
    fn test_second_pending_query_is_rejected() {
        let mut conv = conversation();

        assert!(conv.set_pending_query(PendingQuery {
            prompt: "Password:".into(),
            secret: true,
        }));

        // The duplicate must not clobber the first prompt.
        assert!(!conv.set_pending_query(PendingQuery {
            prompt: "Token:".into(),
            secret: false,
        }));

        let pending = conv.take_pending_query().unwrap();
        assert_eq!(pending.prompt, "Password:");
        assert!(pending.secret);
        assert!(conv.take_pending_query().is_none());
    }

    #[test]
    fn test_reached_authenticated_boundary() {
        assert!(!ConversationState::Authenticating.reached_authenticated());
        assert!(ConversationState::Authenticated.reached_authenticated());
        assert!(ConversationState::SessionStarted.reached_authenticated());
    }

    proptest! {
        // Any jump other than the next forward step, Stopping, or
        // Terminated is refused from every state.
        #[test]
        fn prop_only_forward_neighbors_allowed(from in 0usize..13, to in 0usize..13) {
            let source = FORWARD_ORDER[from];
            let target = FORWARD_ORDER[to];

            let legal = source.allows(target);
            let is_forward_neighbor = to == from + 1;

            prop_assert_eq!(legal, is_forward_neighbor);
        }
    }
}
