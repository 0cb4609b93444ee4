//! Control Channel Wire Contract
//!
//! Message vocabulary spoken between the session controller and its
//! authentication workers, plus the framing used on the private socket.
//!
//! The protocol is internal: both ends ship together, so the encoding only
//! has to be internally consistent, not bit-stable across versions. Frames
//! are 4-byte length-delimited JSON, one message per frame.
//!
//! Worker messages are outcome signals, not requests for privilege: the
//! controller never asks the worker to escalate, it only learns what the
//! worker already decided under its own authority.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::codec::LengthDelimitedCodec;
use zeroize::Zeroize;

use crate::error::ProtocolViolation;

/// Environment variable carrying the control channel address into workers
pub const CHANNEL_ADDRESS_ENV: &str = "LUCID_CHANNEL_ADDRESS";

/// Environment variable marking a worker spawned for reauthentication
pub const FOR_REAUTH_ENV: &str = "LUCID_FOR_REAUTH";

/// Upper bound for a single frame; prompts and environment values are small
const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Length-delimited codec used on both ends of the channel
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Encode one message into a frame payload
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes, ProtocolViolation> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| ProtocolViolation::MalformedFrame(e.to_string()))
}

/// Decode one frame payload into a message
pub fn decode_message<'a, T: Deserialize<'a>>(frame: &'a [u8]) -> Result<T, ProtocolViolation> {
    serde_json::from_slice(frame).map_err(|e| ProtocolViolation::MalformedFrame(e.to_string()))
}

/// A string that is zeroized on drop and never echoed by `Debug`.
///
/// Used for answers to secret queries so passwords do not linger in freed
/// memory or end up in logs.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap an owned string
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Borrow the contained secret
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(<redacted>)")
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl From<&str> for SecretString {
    fn from(text: &str) -> Self {
        Self(text.to_string())
    }
}

/// Display and seat context forwarded to a worker during setup
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupDetails {
    /// Display name (e.g. ":0")
    pub display_name: String,
    /// Host the display is attached to, empty for local displays
    pub hostname: String,
    /// Console device backing the display
    pub device: String,
    /// Seat identifier
    pub seat_id: String,
    /// X11 authority file for the display
    pub x11_authority_file: String,
    /// Whether the display is local to this machine
    pub is_local: bool,
    /// Whether this is the machine's initial display
    pub is_initial: bool,
}

/// Worker → controller messages.
///
/// `Hello` is the only message accepted on an unauthenticated connection;
/// everything else is an outcome signal scoped to the conversation the
/// connection was authenticated as.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WorkerMessage {
    /// Identify the connecting worker; identity is taken from the
    /// OS-reported peer credentials, not from any payload
    Hello,
    /// The authentication service cannot run at all
    ServiceUnavailable {
        /// Worker-provided explanation
        message: String,
    },
    /// Setup finished
    SetupComplete,
    /// Setup failed
    SetupFailed {
        /// Worker-provided explanation
        message: String,
    },
    /// Identity was proven
    Authenticated,
    /// Identity could not be proven
    AuthenticationFailed {
        /// Worker-provided explanation
        message: String,
    },
    /// The user may log in
    Authorized,
    /// The user may not log in
    AuthorizationFailed {
        /// Worker-provided explanation
        message: String,
    },
    /// Credentials were established or refreshed
    Accredited,
    /// Credentials could not be established
    AccreditationFailed {
        /// Worker-provided explanation
        message: String,
    },
    /// The session was opened with the authentication stack
    Opened {
        /// Identifier of the opened session, when the backend assigns one
        session_id: Option<String>,
    },
    /// The session could not be opened
    OpenFailed {
        /// Worker-provided explanation
        message: String,
    },
    /// The user session program is running
    SessionStarted {
        /// Process id of the session
        pid: i32,
    },
    /// The user session program could not be started
    SessionStartFailed {
        /// Worker-provided explanation
        message: String,
    },
    /// The user session program exited
    SessionExited {
        /// Exit status of the session
        status: i32,
    },
    /// The user session program was killed
    SessionDied {
        /// Signal that killed the session
        signal: i32,
    },
    /// Authentication discovered or corrected the username mid-flight
    UsernameChanged {
        /// The newly established username
        username: String,
    },
    /// Informational text to relay to the user
    Info {
        /// Text to relay verbatim
        text: String,
    },
    /// Problem text to relay to the user
    Problem {
        /// Text to relay verbatim
        text: String,
    },
    /// Interactive prompt expecting exactly one answer
    InfoQuery {
        /// Prompt to relay verbatim
        prompt: String,
    },
    /// Interactive prompt whose answer must not be echoed or logged
    SecretInfoQuery {
        /// Prompt to relay verbatim
        prompt: String,
    },
    /// The worker withdraws its own pending query
    CancelPendingQuery,
}

/// Controller → worker verbs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControllerVerb {
    /// Forward display context; worker picks the username itself
    Setup {
        /// Conversation service name
        service_name: String,
        /// Display and seat context
        details: SetupDetails,
    },
    /// Forward display context for an already-selected user
    SetupForUser {
        /// Conversation service name
        service_name: String,
        /// The selected username
        username: String,
        /// Display and seat context
        details: SetupDetails,
    },
    /// Begin the worker's authentication conversation
    StartConversation,
    /// Prove the user's identity
    Authenticate,
    /// Check the user is permitted to log in
    Authorize,
    /// Establish session credentials
    EstablishCredentials,
    /// Refresh previously established credentials
    RefreshCredentials,
    /// Tell the worker which session was chosen
    SetSessionName {
        /// Selected session name
        name: String,
    },
    /// Tell the worker which language was chosen
    SetLanguageName {
        /// Selected language
        name: String,
    },
    /// Tell the worker which user was chosen
    SetUserName {
        /// Selected username
        name: String,
    },
    /// Open the session with the authentication stack
    OpenSession,
    /// Start the session program
    StartSession,
    /// Inject one session environment variable; repeatable
    SetEnvironmentVariable {
        /// Variable name
        key: String,
        /// Variable value
        value: String,
    },
    /// Run the session program; sent only to the winning conversation
    StartProgram {
        /// Command line to execute as the user
        command: String,
    },
    /// Answer to the single pending query
    Answer {
        /// The user's answer; zeroized after use
        text: SecretString,
    },
    /// The pending query was resolved by cancellation, not an answer
    Cancelled,
    /// Rejection of a hello that matched no conversation; the connection
    /// is closed right after this is flushed
    AccessDenied {
        /// Why the peer was turned away
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_round_trip() {
        let frame = encode_message(&WorkerMessage::Hello).unwrap();
        let decoded: WorkerMessage = decode_message(&frame).unwrap();
        assert_eq!(decoded, WorkerMessage::Hello);
    }

    #[test]
    fn test_setup_verb_round_trip() {
        let verb = ControllerVerb::SetupForUser {
            service_name: "password".into(),
            username: "joe".into(),
            details: SetupDetails {
                display_name: ":0".into(),
                seat_id: "seat0".into(),
                is_local: true,
                ..Default::default()
            },
        };

        let frame = encode_message(&verb).unwrap();
        let decoded: ControllerVerb = decode_message(&frame).unwrap();
        assert_eq!(decoded, verb);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_message::<WorkerMessage>(b"{not json").unwrap_err();
        assert!(matches!(err, ProtocolViolation::MalformedFrame(_)));
    }

    #[test]
    fn test_secret_string_debug_is_redacted() {
        let secret = SecretString::new("hunter2");
        assert!(!format!("{:?}", secret).contains("hunter2"));
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_secret_answer_serializes_transparently() {
        let verb = ControllerVerb::Answer {
            text: SecretString::new("pin"),
        };
        let json = serde_json::to_string(&verb).unwrap();
        assert!(json.contains("\"pin\""));
    }
}
