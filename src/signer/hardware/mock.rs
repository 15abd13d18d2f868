//! In-process mock signing device
//!
//! Two modes:
//! - scripted: a delivery thread emits a fixed list of events, then the stream closes
//! - responsive: reports ready, optionally asks for a PIN, and signs with a real key

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use k256::ecdsa::SigningKey;
use secrecy::{ExposeSecret, SecretString};

use super::{DeviceClient, DeviceError, DeviceEvent, KeyPath, PinRequestKind};
use crate::signer::sign_hash;

/// A command received by the mock, for assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    SignMessage { path: KeyPath, message: String },
    ProvidePin(String),
    Stop,
}

enum Mode {
    Scripted(Vec<DeviceEvent>),
    Responsive {
        key: Option<SigningKey>,
        pin: Option<String>,
    },
}

/// Mock device for tests and dry runs.
pub struct MockDevice {
    mode: Mode,
    commands: Vec<DeviceCommand>,
    events: Option<Sender<DeviceEvent>>,
    script_thread: Option<JoinHandle<()>>,
    pending_message: Option<String>,
}

impl MockDevice {
    /// Emit `events` in order from a delivery thread, then close the stream.
    pub fn scripted(events: Vec<DeviceEvent>) -> Self {
        Self::with_mode(Mode::Scripted(events))
    }

    /// A connected device holding `key`.
    pub fn responsive(key: SigningKey) -> Self {
        Self::with_mode(Mode::Responsive {
            key: Some(key),
            pin: None,
        })
    }

    /// A connected device without any keys.
    pub fn empty() -> Self {
        Self::with_mode(Mode::Responsive { key: None, pin: None })
    }

    /// Require `pin` before signing (responsive mode only).
    pub fn with_pin(mut self, required: &str) -> Self {
        if let Mode::Responsive { pin, .. } = &mut self.mode {
            *pin = Some(required.to_string());
        }
        self
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            commands: Vec::new(),
            events: None,
            script_thread: None,
            pending_message: None,
        }
    }

    /// Commands received so far.
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.commands.clone()
    }

    fn emit(&self, event: DeviceEvent) -> Result<(), DeviceError> {
        let sender = self.events.as_ref().ok_or(DeviceError::NotStarted)?;
        sender.send(event).map_err(|_| DeviceError::StreamClosed)
    }

    fn sign_pending(&mut self) -> Result<(), DeviceError> {
        let Mode::Responsive { key: Some(key), .. } = &self.mode else {
            return Ok(());
        };
        let Some(message) = self.pending_message.take() else {
            return Ok(());
        };

        // The message is the hex of the manifest hash.
        let mut hash = [0u8; 32];
        hex::decode_to_slice(&message, &mut hash)
            .map_err(|e| DeviceError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        let signature = sign_hash(key, &hash)
            .map_err(|e| DeviceError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        self.emit(DeviceEvent::MessageSignature(signature.to_bytes().to_vec()))
    }
}

impl DeviceClient for MockDevice {
    fn start(&mut self) -> Result<Receiver<DeviceEvent>, DeviceError> {
        let (tx, rx) = mpsc::channel();
        match &self.mode {
            Mode::Scripted(script) => {
                let script = script.clone();
                self.script_thread = Some(thread::spawn(move || {
                    for event in script {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }));
            }
            Mode::Responsive { key, .. } => {
                let wallet_present = key.is_some();
                self.events = Some(tx);
                self.emit(DeviceEvent::Ready { wallet_present })?;
            }
        }
        Ok(rx)
    }

    fn sign_message(&mut self, path: &KeyPath, message: &str) -> Result<(), DeviceError> {
        self.commands.push(DeviceCommand::SignMessage {
            path: *path,
            message: message.to_string(),
        });
        if !matches!(self.mode, Mode::Responsive { .. }) {
            return Ok(());
        }

        self.pending_message = Some(message.to_string());
        if matches!(self.mode, Mode::Responsive { pin: Some(_), .. }) {
            return self.emit(DeviceEvent::PinRequested(PinRequestKind::Current));
        }
        self.sign_pending()
    }

    fn provide_pin(&mut self, pin: &SecretString) -> Result<(), DeviceError> {
        let entered = pin.expose_secret().to_string();
        self.commands.push(DeviceCommand::ProvidePin(entered.clone()));

        match &self.mode {
            Mode::Responsive { pin: Some(required), .. } if *required == entered => self.sign_pending(),
            Mode::Responsive { .. } => self.emit(DeviceEvent::PinRequested(PinRequestKind::Current)),
            Mode::Scripted(_) => Ok(()),
        }
    }

    fn stop(&mut self) {
        self.commands.push(DeviceCommand::Stop);
        self.events = None;
        if let Some(handle) = self.script_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_scripted_stream_closes_after_script() {
        let mut device = MockDevice::scripted(vec![DeviceEvent::Detached]);
        let rx = device.start().unwrap();
        assert_eq!(rx.recv().unwrap(), DeviceEvent::Detached);
        assert!(rx.recv().is_err());
        device.stop();
    }

    #[test]
    fn test_empty_device_reports_no_wallet() {
        let mut device = MockDevice::empty();
        let rx = device.start().unwrap();
        assert_eq!(rx.recv().unwrap(), DeviceEvent::Ready { wallet_present: false });
    }

    #[test]
    fn test_wrong_pin_asks_again() {
        let mut device = MockDevice::responsive(SigningKey::random(&mut OsRng)).with_pin("42");
        let rx = device.start().unwrap();
        rx.recv().unwrap();

        device.sign_message(&KeyPath::default(), &"00".repeat(32)).unwrap();
        assert_eq!(rx.recv().unwrap(), DeviceEvent::PinRequested(PinRequestKind::Current));

        device.provide_pin(&SecretString::from("41".to_string())).unwrap();
        assert_eq!(rx.recv().unwrap(), DeviceEvent::PinRequested(PinRequestKind::Current));

        device.provide_pin(&SecretString::from("42".to_string())).unwrap();
        assert!(matches!(rx.recv().unwrap(), DeviceEvent::MessageSignature(bytes) if bytes.len() == 65));
    }
}
