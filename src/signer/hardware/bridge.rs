//! Device bridge client
//!
//! The USB side of a hardware wallet lives in a separate helper process.
//! The bridge speaks line-delimited JSON: commands are written to the
//! helper's stdin, events are read from its stdout on a reader thread.
//!
//! ```text
//! → {"command":"sign_message","account":0,"index":0,"message":"<hex>"}
//! → {"command":"provide_pin","pin":"..."}
//! ← {"event":"ready","wallet_present":true}
//! ← {"event":"detached"}
//! ← {"event":"pin_requested","kind":"current"}
//! ← {"event":"message_signature","signature":"<base64>"}
//! ```

use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DeviceClient, DeviceError, DeviceEvent, KeyPath, PinRequestKind};

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeEvent {
    Ready { wallet_present: bool },
    Detached,
    PinRequested { kind: PinRequestKind },
    MessageSignature { signature: String },
}

impl From<BridgeEvent> for DeviceEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Ready { wallet_present } => DeviceEvent::Ready { wallet_present },
            BridgeEvent::Detached => DeviceEvent::Detached,
            BridgeEvent::PinRequested { kind } => DeviceEvent::PinRequested(kind),
            BridgeEvent::MessageSignature { signature } => {
                // An undecodable signature recovers no key and fails the session.
                let bytes = BASE64.decode(signature.trim()).unwrap_or_else(|e| {
                    warn!(error = %e, "device bridge sent invalid base64 signature");
                    Vec::new()
                });
                DeviceEvent::MessageSignature(bytes)
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    SignMessage { account: u32, index: u32, message: &'a str },
    ProvidePin { pin: &'a str },
}

/// Parse one line of bridge output.
fn parse_event(line: &str) -> Result<DeviceEvent, serde_json::Error> {
    serde_json::from_str::<BridgeEvent>(line).map(DeviceEvent::from)
}

/// Device client backed by a bridge helper process.
pub struct BridgeDevice {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
}

impl BridgeDevice {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
            stdin: None,
            reader: None,
        }
    }

    /// Split a whitespace-separated command line into program and arguments.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    /// Resolve the bridge program without starting it.
    ///
    /// Lets a run reject a missing bridge before it touches the working directory.
    pub fn locate(&self) -> Result<PathBuf, DeviceError> {
        which::which(&self.program).map_err(|e| DeviceError::Spawn {
            command: self.command_line(),
            source: io::Error::new(io::ErrorKind::NotFound, e.to_string()),
        })
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn send(&mut self, command: &BridgeCommand<'_>) -> Result<(), DeviceError> {
        let stdin = self.stdin.as_mut().ok_or(DeviceError::NotStarted)?;
        let line = serde_json::to_string(command)?;
        writeln!(stdin, "{}", line)?;
        stdin.flush()?;
        Ok(())
    }
}

impl DeviceClient for BridgeDevice {
    fn start(&mut self) -> Result<Receiver<DeviceEvent>, DeviceError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| DeviceError::Spawn {
                command: self.command_line(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(DeviceError::NotStarted)?;
        self.stdin = child.stdin.take();
        self.child = Some(child);

        let (tx, rx) = mpsc::channel();
        self.reader = Some(thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "device bridge read failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_event(&line) {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, line = %line, "ignoring unparseable device bridge line"),
                }
            }
            debug!("device bridge output closed");
        }));

        Ok(rx)
    }

    fn sign_message(&mut self, path: &KeyPath, message: &str) -> Result<(), DeviceError> {
        self.send(&BridgeCommand::SignMessage {
            account: path.account,
            index: path.index,
            message,
        })
    }

    fn provide_pin(&mut self, pin: &SecretString) -> Result<(), DeviceError> {
        self.send(&BridgeCommand::ProvidePin {
            pin: pin.expose_secret(),
        })
    }

    fn stop(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for BridgeDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_events() {
        assert_eq!(
            parse_event(r#"{"event":"ready","wallet_present":true}"#).unwrap(),
            DeviceEvent::Ready { wallet_present: true }
        );
        assert_eq!(parse_event(r#"{"event":"detached"}"#).unwrap(), DeviceEvent::Detached);
        assert_eq!(
            parse_event(r#"{"event":"pin_requested","kind":"new_second"}"#).unwrap(),
            DeviceEvent::PinRequested(PinRequestKind::NewSecond)
        );
        assert_eq!(
            parse_event(r#"{"event":"message_signature","signature":"AQID"}"#).unwrap(),
            DeviceEvent::MessageSignature(vec![1, 2, 3])
        );
        assert!(parse_event(r#"{"event":"reboot"}"#).is_err());
    }

    #[test]
    fn test_command_wire_form() {
        let sign = serde_json::to_string(&BridgeCommand::SignMessage {
            account: 0,
            index: 0,
            message: "abcd",
        })
        .unwrap();
        assert_eq!(
            sign,
            r#"{"command":"sign_message","account":0,"index":0,"message":"abcd"}"#
        );

        let pin = serde_json::to_string(&BridgeCommand::ProvidePin { pin: "1234" }).unwrap();
        assert_eq!(pin, r#"{"command":"provide_pin","pin":"1234"}"#);
    }

    #[test]
    fn test_from_command_line() {
        let device = BridgeDevice::from_command_line("trezor-bridge --usb  -v").unwrap();
        assert_eq!(device.program, "trezor-bridge");
        assert_eq!(device.args, vec!["--usb", "-v"]);
        assert!(BridgeDevice::from_command_line("   ").is_none());
    }

    #[test]
    fn test_locate_missing_program() {
        let device = BridgeDevice::new("/nonexistent/ufx-device-bridge", Vec::new());
        assert!(matches!(device.locate(), Err(DeviceError::Spawn { .. })));
    }

    #[test]
    fn test_spawn_failure() {
        let mut device = BridgeDevice::new("/nonexistent/ufx-device-bridge", Vec::new());
        assert!(matches!(device.start(), Err(DeviceError::Spawn { .. })));
    }
}
