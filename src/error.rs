//! Engine Error Taxonomy
//!
//! Typed errors for the conversation engine. Raw OS and transport errors are
//! translated into one of these kinds by the component that detected them;
//! the session controller never sees raw errno values.

use thiserror::Error;

/// Worker process could not be created.
///
/// Fatal to the one conversation that tried to spawn it; the controller
/// surfaces it as "this authentication service is unavailable".
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The configured worker command line could not be parsed
    #[error("could not parse worker command: {0:?}")]
    BadCommand(String),

    /// A worker process is already running for this job
    #[error("worker job is already running (pid {0})")]
    AlreadyRunning(i32),

    /// The OS spawn call failed
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Control channel transport failure.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The private socket directory could not be created or secured
    #[error("failed to prepare private socket directory {dir}: {source}")]
    SocketDir {
        /// Directory that was being prepared
        dir: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Binding the listener failed
    #[error("failed to bind control channel at {address}: {source}")]
    Bind {
        /// Socket path that was being bound
        address: String,
        /// Underlying I/O error
        source: std::io::Error,
    },
}

/// A peer misbehaved on the control channel.
///
/// Always recovered locally by rejecting or closing the offending
/// connection; never crashes the server.
#[derive(Error, Debug)]
pub enum ProtocolViolation {
    /// Transport-level credential check rejected the peer
    #[error("peer uid {uid} (pid {pid:?}) is not authorized")]
    CredentialsRejected {
        /// OS-reported peer uid
        uid: u32,
        /// OS-reported peer pid, if the platform exposes it
        pid: Option<i32>,
    },

    /// A hello arrived from a pid that matches no pending conversation
    #[error("hello from unknown peer pid {pid:?}")]
    UnknownPeer {
        /// OS-reported peer pid
        pid: Option<i32>,
    },

    /// A message other than hello arrived on an unauthenticated connection
    #[error("message before hello on connection {connection}")]
    MessageBeforeHello {
        /// Offending connection id
        connection: u64,
    },

    /// A frame could not be decoded
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A second interactive query arrived while one was already pending
    #[error("query already pending for conversation {service}")]
    QueryAlreadyPending {
        /// Conversation the worker tried to double-query
        service: String,
    },
}

/// The worker went away before verification completed.
///
/// Reported upward as "authentication failed"; retrying is the caller's
/// choice (start the conversation again).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// Worker exited before the conversation reached the authenticated state
    #[error("worker exited with status {code} before verification completed")]
    WorkerExited {
        /// Exit status of the worker
        code: i32,
    },

    /// Worker was killed before the conversation reached the authenticated state
    #[error("worker died from signal {signal} before verification completed")]
    WorkerDied {
        /// Signal that killed the worker
        signal: i32,
    },

    /// The worker reported the authentication service itself as unavailable
    #[error("authentication service unavailable: {message}")]
    ServiceUnavailable {
        /// Worker-provided explanation
        message: String,
    },
}

/// A live session's worker terminated after the session had started.
///
/// Logged as an abnormal session end, never as a login failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionCrash {
    /// The session process exited
    #[error("session exited with status {0}")]
    Exited(i32),

    /// The session process was killed by a signal
    #[error("session died from signal {0}")]
    Died(i32),
}

/// A pending interactive query was resolved by cancellation, not an answer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("pending query was cancelled")]
pub struct CancelledQuery;
