//! Private control channel between the session controller and its workers
//!
//! The channel is the only trust boundary between the low-privilege front
//! end and the root-privileged authentication workers: a per-instance unix
//! socket at an unguessable address, a transport-level peer-credential gate,
//! and a hello handshake that binds each connection to the conversation
//! whose worker process actually dialed in.

pub mod connection;
pub mod protocol;
pub mod server;

pub use connection::{ChannelEvent, ConnectionHandle, ConnectionId, PeerCredentials};
pub use protocol::{ControllerVerb, SecretString, SetupDetails, WorkerMessage};
pub use server::ChannelServer;
