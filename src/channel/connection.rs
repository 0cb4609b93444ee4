//! Channel Connection Plumbing
//!
//! Each accepted worker connection is split into a reader task that turns
//! inbound frames into [`ChannelEvent`]s and a writer task that serializes
//! outbound verbs. The controller holds a [`ConnectionHandle`]; dropping the
//! handle closes the connection once queued verbs have been flushed.

use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use super::protocol::{self, ControllerVerb, WorkerMessage};

/// Identifies one accepted connection for the lifetime of the server
pub type ConnectionId = u64;

/// OS-reported credentials of a connected peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Peer uid
    pub uid: u32,
    /// Peer gid
    pub gid: u32,
    /// Peer pid, when the platform reports one
    pub pid: Option<i32>,
}

/// Events delivered from the channel into the controller's event flow
#[derive(Debug)]
pub enum ChannelEvent {
    /// A credential-checked connection was accepted and is now pending
    Connected {
        /// Connection id
        id: ConnectionId,
        /// OS-reported peer credentials
        peer: PeerCredentials,
        /// Verb sink for the connection
        handle: ConnectionHandle,
    },
    /// A message arrived on a connection
    Message {
        /// Connection id
        id: ConnectionId,
        /// The decoded message
        message: WorkerMessage,
    },
    /// The peer closed the connection or the stream failed
    Disconnected {
        /// Connection id
        id: ConnectionId,
    },
}

/// Write side of one worker connection.
///
/// Sends are fire-and-forget: a verb queued against a connection that is
/// already gone is dropped with a debug log, which is the correct behavior
/// for teardown races.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: PeerCredentials,
    verbs: mpsc::UnboundedSender<ControllerVerb>,
}

impl ConnectionHandle {
    /// Connection id this handle writes to
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Credentials the transport reported for the peer
    pub fn peer(&self) -> PeerCredentials {
        self.peer
    }

    /// Queue one verb for delivery
    pub fn send(&self, verb: ControllerVerb) {
        if self.verbs.send(verb).is_err() {
            debug!("Dropping verb for closed connection {}", self.id);
        }
    }
}

/// One spawned connection: the controller-facing handle plus the I/O tasks,
/// kept so the server can tear the connection down on `stop()`.
#[derive(Debug)]
pub struct Connection {
    /// Verb sink handed to the controller
    pub handle: ConnectionHandle,
    /// Reader task, emits events until the stream ends
    pub reader: tokio::task::JoinHandle<()>,
    /// Writer task, drains queued verbs
    pub writer: tokio::task::JoinHandle<()>,
}

/// Split an accepted stream into reader/writer tasks.
///
/// The reader task emits exactly one `Disconnected` event when the stream
/// ends, fails, or delivers an undecodable frame (a protocol violation is
/// answered by closing the connection, never by crashing the server).
pub fn spawn_connection(
    stream: UnixStream,
    id: ConnectionId,
    peer: PeerCredentials,
    events: mpsc::UnboundedSender<ChannelEvent>,
) -> Connection {
    let (read_half, write_half) = stream.into_split();
    let (verbs_tx, verbs_rx) = mpsc::unbounded_channel();

    let reader = tokio::spawn(read_loop(read_half, id, events));
    let writer = tokio::spawn(write_loop(write_half, id, verbs_rx));

    Connection {
        handle: ConnectionHandle {
            id,
            peer,
            verbs: verbs_tx,
        },
        reader,
        writer,
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    id: ConnectionId,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut frames = FramedRead::new(read_half, protocol::frame_codec());

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Connection {}: stream error: {}", id, e);
                break;
            }
        };

        match protocol::decode_message::<WorkerMessage>(&frame) {
            Ok(message) => {
                trace!("Connection {}: received {:?}", id, message);
                if events.send(ChannelEvent::Message { id, message }).is_err() {
                    break;
                }
            }
            Err(violation) => {
                warn!("Connection {}: closing: {}", id, violation);
                break;
            }
        }
    }

    let _ = events.send(ChannelEvent::Disconnected { id });
    debug!("Connection {}: reader finished", id);
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    id: ConnectionId,
    mut verbs: mpsc::UnboundedReceiver<ControllerVerb>,
) {
    let mut frames = FramedWrite::new(write_half, protocol::frame_codec());

    while let Some(verb) = verbs.recv().await {
        let frame = match protocol::encode_message(&verb) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Connection {}: failed to encode verb: {}", id, e);
                continue;
            }
        };

        if let Err(e) = frames.send(frame).await {
            debug!("Connection {}: write failed: {}", id, e);
            break;
        }
    }

    debug!("Connection {}: writer finished", id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_survives_peer_close() {
        let (server, client) = UnixStream::pair().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let peer = PeerCredentials {
            uid: 0,
            gid: 0,
            pid: Some(1234),
        };
        let conn = spawn_connection(server, 7, peer, events_tx);

        drop(client);

        match events_rx.recv().await {
            Some(ChannelEvent::Disconnected { id }) => assert_eq!(id, 7),
            other => panic!("expected Disconnected, got {:?}", other),
        }

        // Sending into the dead connection is a logged no-op.
        conn.handle.send(ControllerVerb::Authenticate);
    }

    #[tokio::test]
    async fn test_message_flows_end_to_end() {
        let (server, client) = UnixStream::pair().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let peer = PeerCredentials {
            uid: 0,
            gid: 0,
            pid: Some(42),
        };
        let conn = spawn_connection(server, 1, peer, events_tx);

        // The "worker" end speaks the same framing.
        let (read_half, write_half) = client.into_split();
        let mut worker_out = FramedWrite::new(write_half, protocol::frame_codec());
        let mut worker_in = FramedRead::new(read_half, protocol::frame_codec());

        worker_out
            .send(protocol::encode_message(&WorkerMessage::Hello).unwrap())
            .await
            .unwrap();

        match events_rx.recv().await {
            Some(ChannelEvent::Message { id, message }) => {
                assert_eq!(id, 1);
                assert_eq!(message, WorkerMessage::Hello);
            }
            other => panic!("expected Hello, got {:?}", other),
        }

        conn.handle.send(ControllerVerb::Authenticate);
        let frame = worker_in.next().await.unwrap().unwrap();
        let verb: ControllerVerb = protocol::decode_message(&frame).unwrap();
        assert_eq!(verb, ControllerVerb::Authenticate);
    }
}
