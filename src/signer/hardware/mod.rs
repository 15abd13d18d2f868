//! Hardware signing device backend
//!
//! The device is reached through a [`DeviceClient`]: commands go out as
//! method calls, events come back on a channel fed by the client's own
//! delivery thread. [`HardwareSigner`] consumes that channel on the calling
//! thread and lets a [`SigningSession`] decide what each event means.

pub mod bridge;
pub mod mock;
pub mod session;

use std::io;
use std::sync::mpsc::Receiver;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::{PublicKey, RecoverableSignature, Signer, SignerError};
use crate::console::Console;

pub use bridge::BridgeDevice;
pub use mock::{DeviceCommand, MockDevice};
pub use session::{SessionAction, SessionOutcome, SessionState, SigningSession, StateKind};

/// Shown when the device is not connected yet.
pub const PLUG_IN_MESSAGE: &str = "Waiting for TREZOR to be plugged in ...";

/// Shown before the PIN prompt. The device shows a scrambled keypad; the
/// user types the positions of the digits on it.
pub const PIN_KEYPAD_HELP: &str = "Please enter your PIN using the positions shown on the device:\n\n  7 8 9\n  4 5 6\n  1 2 3\n";

/// Which PIN the device is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinRequestKind {
    /// The PIN currently set on the device
    Current,
    /// First entry of a new PIN
    NewFirst,
    /// Confirmation of a new PIN
    NewSecond,
}

/// Events emitted by a signing device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device is connected; `wallet_present` is false if it holds no keys.
    Ready { wallet_present: bool },
    /// The device was unplugged.
    Detached,
    /// The device wants a PIN.
    PinRequested(PinRequestKind),
    /// Compact signature produced for the last `sign_message`.
    MessageSignature(Vec<u8>),
}

/// Derivation path of the signing key on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyPath {
    pub account: u32,
    pub index: u32,
}

/// Why a hardware signing session failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningFailure {
    #[error("device was disconnected")]
    DeviceDisconnected,

    #[error("you need to have created a wallet on your TREZOR first")]
    NoKeysOnDevice,

    #[error("device asked for an unexpected PIN ({0:?})")]
    UnexpectedPinRequest(PinRequestKind),

    #[error("signature does not match the expected key (expected {}, got {})",
        .expected.as_ref().map_or_else(|| "any".to_string(), PublicKey::to_hex),
        .actual.as_ref().map_or_else(|| "none".to_string(), PublicKey::to_hex))]
    MismatchedKey {
        expected: Option<PublicKey>,
        actual: Option<PublicKey>,
    },
}

/// Device transport errors
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to start device bridge `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("device message error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("device event stream closed")]
    StreamClosed,

    #[error("device not started")]
    NotStarted,
}

/// Connection to a signing device.
pub trait DeviceClient {
    /// Connect and return the stream of device events.
    fn start(&mut self) -> Result<Receiver<DeviceEvent>, DeviceError>;

    /// Ask the device to sign `message` with the key at `path`.
    fn sign_message(&mut self, path: &KeyPath, message: &str) -> Result<(), DeviceError>;

    /// Answer a PIN request.
    fn provide_pin(&mut self, pin: &SecretString) -> Result<(), DeviceError>;

    /// Disconnect; called once the session resolves, whatever the outcome.
    fn stop(&mut self);
}

/// Signs by driving a [`DeviceClient`] through a [`SigningSession`].
pub struct HardwareSigner<'c, D: DeviceClient, C: Console + ?Sized> {
    device: D,
    console: &'c C,
    expected: Option<PublicKey>,
    key_path: KeyPath,
}

impl<'c, D: DeviceClient, C: Console + ?Sized> HardwareSigner<'c, D, C> {
    pub fn new(device: D, console: &'c C, expected: Option<PublicKey>) -> Self {
        Self {
            device,
            console,
            expected,
            key_path: KeyPath::default(),
        }
    }

    pub fn with_key_path(mut self, key_path: KeyPath) -> Self {
        self.key_path = key_path;
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Run one signing session to completion.
    pub fn run_session(&mut self, hash: &[u8; 32]) -> Result<SessionOutcome, SignerError> {
        let events = self.device.start()?;
        let result = self.drive(&events, hash);
        self.device.stop();
        result
    }

    fn drive(&mut self, events: &Receiver<DeviceEvent>, hash: &[u8; 32]) -> Result<SessionOutcome, SignerError> {
        let mut session = SigningSession::new(*hash, self.expected.clone(), self.key_path);

        loop {
            let event = events.recv().map_err(|_| DeviceError::StreamClosed)?;
            debug!(?event, "device event");

            for action in session.handle(event) {
                match action {
                    SessionAction::AskToPlugIn => self.console.say(PLUG_IN_MESSAGE),
                    SessionAction::SignMessage { path, message } => {
                        info!(account = path.account, index = path.index, "requesting signature from device");
                        self.device.sign_message(&path, &message)?;
                    }
                    SessionAction::RequestPin => {
                        self.console.say(PIN_KEYPAD_HELP);
                        let pin = self
                            .console
                            .read_secret("PIN: ")
                            .map_err(|e| SignerError::Aborted(format!("no PIN entered: {}", e)))?;
                        self.device.provide_pin(&pin)?;
                        session.pin_submitted();
                    }
                }
            }

            if let Some(outcome) = session.outcome() {
                return Ok(outcome);
            }
        }
    }
}

impl<D: DeviceClient, C: Console + ?Sized> Signer for HardwareSigner<'_, D, C> {
    fn sign(&mut self, hash: &[u8; 32]) -> Result<RecoverableSignature, SignerError> {
        match self.run_session(hash)? {
            SessionOutcome::Completed(signature) => Ok(signature),
            SessionOutcome::Failed(reason) => Err(SignerError::Protocol(reason)),
        }
    }

    fn expected_key(&self) -> Option<&PublicKey> {
        self.expected.as_ref()
    }
}
