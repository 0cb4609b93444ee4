//! # lucid-dm
//!
//! Display/session manager daemon core: the session conversation engine.
//!
//! A low-privilege controller drives root-privileged authentication workers
//! through a fixed verification state machine, over a private control
//! channel that only the workers it spawned can authenticate against.
//!
//! # Architecture
//!
//! ```text
//! SessionController (one per display)
//!   ├─> Conversation "password" ──> WorkerJob (worker process)
//!   ├─> Conversation "smartcard" ─> WorkerJob (worker process)
//!   └─> ChannelServer (private unix socket, peer-credential gate)
//!          ▲                ▲
//!          └── hello by pid ┴── outcome signals / queries
//! ```
//!
//! # Control Flow
//!
//! **Spawn path:** controller → WorkerJob → worker process → dials the
//! channel address from its environment → hello → matched to its
//! conversation by OS-reported pid.
//!
//! **Verification path:** controller verbs (setup, authenticate, authorize,
//! accredit, open, start) flow controller → worker; outcome signals and
//! interactive queries flow worker → controller; everything lands in one
//! sequential event stream.
//!
//! **Teardown path:** the first conversation to start its session wins;
//! every other conversation is stopped, its pending query cancelled, its
//! worker terminated and reaped.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Daemon configuration
pub mod config;

/// Typed error taxonomy
pub mod error;

/// Private control channel (transport, peer authentication, wire contract)
pub mod channel;

/// Session conversation engine (controller, conversations, worker jobs)
pub mod session;

pub use channel::{ChannelServer, ControllerVerb, SecretString, WorkerMessage};
pub use config::DaemonConfig;
pub use session::{
    ConversationState, SessionController, SessionEvent, SessionOutcome, SessionRecordSink,
};
