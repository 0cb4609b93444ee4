//! Session conversation engine
//!
//! One [`controller::SessionController`] per display owns a set of
//! [`conversation::Conversation`]s, each pairing a privilege-separated
//! [`worker_job::WorkerJob`] with one authenticated control channel
//! connection, and drives the fixed verification state machine
//! (setup → authenticate → authorize → accredit → open → start) across them.

pub mod context;
pub mod controller;
pub mod conversation;
pub mod record;
pub mod worker_job;

pub use context::SessionContext;
pub use controller::{SessionController, SessionEvent, SessionOutcome};
pub use conversation::{Conversation, ConversationState, PendingQuery};
pub use record::{LogRecordSink, NullRecordSink, SessionRecord, SessionRecordSink};
pub use worker_job::{JobEvent, WorkerJob};
