//! Private Control Channel Server
//!
//! Listens on a freshly generated, unguessable unix socket scoped to one
//! session controller. The address is a capability: it is handed to exactly
//! the worker processes the controller spawns (via their environment) and is
//! never published anywhere else.
//!
//! The server performs only the transport-level credential check. Matching a
//! connection to a conversation (the application-level hello) happens in the
//! controller, which owns the conversations.

use parking_lot::Mutex;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::error::{ProtocolViolation, TransportError};

use super::connection::{self, ChannelEvent, Connection, PeerCredentials};

/// Private, peer-authenticated channel server for one session controller.
///
/// The generated socket address is single-use: it is never reused across
/// controller instances, so a stale worker can never authenticate against
/// the wrong controller.
pub struct ChannelServer {
    address: PathBuf,
    accept_task: Option<JoinHandle<()>>,
    connections: Arc<Mutex<Vec<Connection>>>,
}

impl ChannelServer {
    /// Generate a fresh address, begin listening and accepting.
    ///
    /// Accepted, credential-checked connections are reported on `events`
    /// as [`ChannelEvent::Connected`].
    pub fn start(
        config: &ChannelConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Self, TransportError> {
        let dir = &config.socket_dir;

        std::fs::create_dir_all(dir).map_err(|source| TransportError::SocketDir {
            dir: dir.display().to_string(),
            source,
        })?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o711)).map_err(
            |source| TransportError::SocketDir {
                dir: dir.display().to_string(),
                source,
            },
        )?;

        let address = dir.join(Uuid::new_v4().simple().to_string());

        let listener = UnixListener::bind(&address).map_err(|source| TransportError::Bind {
            address: address.display().to_string(),
            source,
        })?;

        // Workers may have dropped privileges before connecting; the
        // credential check is what gates access, not the file mode.
        if let Err(e) =
            std::fs::set_permissions(&address, std::fs::Permissions::from_mode(0o666))
        {
            warn!("Failed to relax socket permissions: {}", e);
        }

        info!("Control channel listening on {}", address.display());

        let connections = Arc::new(Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            config.allowed_uid,
            events,
            Arc::clone(&connections),
        ));

        Ok(Self {
            address,
            accept_task: Some(accept_task),
            connections,
        })
    }

    /// The socket path workers must connect to
    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Close the listener and drop every live connection.
    ///
    /// Pending queries on conversations are the controller's to resolve
    /// before it discards the server.
    pub fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }

        for conn in self.connections.lock().drain(..) {
            conn.reader.abort();
            conn.writer.abort();
        }

        if let Err(e) = std::fs::remove_file(&self.address) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Failed to remove socket {}: {}", self.address.display(), e);
            }
        }
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: UnixListener,
    allowed_uid: u32,
    events: mpsc::UnboundedSender<ChannelEvent>,
    connections: Arc<Mutex<Vec<Connection>>>,
) {
    let next_id = AtomicU64::new(1);

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("Failed to accept channel connection: {}", e);
                continue;
            }
        };

        let peer = match read_peer_credentials(&stream) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Dropping connection without readable credentials: {}", e);
                continue;
            }
        };

        if let Err(violation) = check_peer(peer, allowed_uid) {
            warn!("Rejecting channel connection: {}", violation);
            continue;
        }

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Accepted channel connection {} from uid {} pid {:?}",
            id, peer.uid, peer.pid
        );

        let conn = connection::spawn_connection(stream, id, peer, events.clone());
        let handle = conn.handle.clone();
        connections.lock().push(conn);

        if events
            .send(ChannelEvent::Connected { id, peer, handle })
            .is_err()
        {
            // Controller is gone; nothing left to accept for.
            return;
        }
    }
}

fn read_peer_credentials(stream: &UnixStream) -> std::io::Result<PeerCredentials> {
    let cred = stream.peer_cred()?;
    Ok(PeerCredentials {
        uid: cred.uid(),
        gid: cred.gid(),
        pid: cred.pid(),
    })
}

/// Transport-level gate: root always may connect, plus one configured uid
/// for channels whose workers drop privileges before dialing back.
fn check_peer(peer: PeerCredentials, allowed_uid: u32) -> Result<(), ProtocolViolation> {
    if peer.uid == 0 || peer.uid == allowed_uid {
        return Ok(());
    }

    Err(ProtocolViolation::CredentialsRejected {
        uid: peer.uid,
        pid: peer.pid,
    })
}
