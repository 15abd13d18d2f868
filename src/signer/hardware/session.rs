//! Hardware signing session state machine
//!
//! AwaitingDevice → DeviceReady → AwaitingSignature ⇄ AwaitingPin → Completed,
//! with Failed reachable from every state once the device has been started.
//!
//! The session is pure: it consumes [`DeviceEvent`]s in arrival order and
//! returns the [`SessionAction`]s the driver must carry out. It resolves
//! exactly once; later events are ignored.

use tracing::debug;

use super::{DeviceEvent, KeyPath, PinRequestKind, SigningFailure};
use crate::signer::{message_for_hash, PublicKey, RecoverableSignature};

/// State tags, without payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    AwaitingDevice,
    DeviceReady,
    AwaitingSignature,
    AwaitingPin,
    Completed,
    Failed,
}

impl StateKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StateKind::Completed | StateKind::Failed)
    }

    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: StateKind) -> bool {
        match (self, target) {
            (StateKind::AwaitingDevice, StateKind::DeviceReady) => true,
            (StateKind::AwaitingDevice, StateKind::Failed) => true, // No keys on device

            (StateKind::DeviceReady, StateKind::AwaitingSignature) => true,
            (StateKind::DeviceReady, StateKind::Failed) => true,

            (StateKind::AwaitingSignature, StateKind::AwaitingPin) => true,
            (StateKind::AwaitingSignature, StateKind::Completed) => true,
            (StateKind::AwaitingSignature, StateKind::Failed) => true,

            (StateKind::AwaitingPin, StateKind::AwaitingSignature) => true,
            (StateKind::AwaitingPin, StateKind::Failed) => true,

            // Terminal states cannot transition
            _ => false,
        }
    }
}

/// Session state with payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingDevice,
    DeviceReady,
    AwaitingSignature,
    AwaitingPin,
    Completed(RecoverableSignature),
    Failed(SigningFailure),
}

impl SessionState {
    pub fn kind(&self) -> StateKind {
        match self {
            SessionState::AwaitingDevice => StateKind::AwaitingDevice,
            SessionState::DeviceReady => StateKind::DeviceReady,
            SessionState::AwaitingSignature => StateKind::AwaitingSignature,
            SessionState::AwaitingPin => StateKind::AwaitingPin,
            SessionState::Completed(_) => StateKind::Completed,
            SessionState::Failed(_) => StateKind::Failed,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed(RecoverableSignature),
    Failed(SigningFailure),
}

/// Work the driver has to do in response to an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Tell the user to connect the device.
    AskToPlugIn,
    /// Send `sign_message` to the device.
    SignMessage { path: KeyPath, message: String },
    /// Prompt for the PIN, submit it, then call [`SigningSession::pin_submitted`].
    RequestPin,
}

/// One signing call against a hardware device.
#[derive(Debug)]
pub struct SigningSession {
    hash: [u8; 32],
    expected: Option<PublicKey>,
    key_path: KeyPath,
    state: SessionState,
    started: bool,
    trace: Vec<StateKind>,
}

impl SigningSession {
    pub fn new(hash: [u8; 32], expected: Option<PublicKey>, key_path: KeyPath) -> Self {
        Self {
            hash,
            expected,
            key_path,
            state: SessionState::AwaitingDevice,
            started: false,
            trace: vec![StateKind::AwaitingDevice],
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Every state entered so far, in order.
    pub fn trace(&self) -> &[StateKind] {
        &self.trace
    }

    pub fn is_resolved(&self) -> bool {
        self.state.kind().is_terminal()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        match &self.state {
            SessionState::Completed(sig) => Some(SessionOutcome::Completed(sig.clone())),
            SessionState::Failed(reason) => Some(SessionOutcome::Failed(reason.clone())),
            _ => None,
        }
    }

    /// Feed the next device event.
    pub fn handle(&mut self, event: DeviceEvent) -> Vec<SessionAction> {
        if self.is_resolved() {
            debug!(?event, "session already resolved, ignoring event");
            return Vec::new();
        }

        match (self.state.kind(), event) {
            (StateKind::AwaitingDevice, DeviceEvent::Detached) => vec![SessionAction::AskToPlugIn],

            (StateKind::AwaitingDevice, DeviceEvent::Ready { wallet_present: false }) => {
                self.enter(SessionState::Failed(SigningFailure::NoKeysOnDevice));
                Vec::new()
            }

            (StateKind::AwaitingDevice, DeviceEvent::Ready { wallet_present: true }) => {
                self.started = true;
                self.enter(SessionState::DeviceReady);
                let message = message_for_hash(&self.hash);
                self.enter(SessionState::AwaitingSignature);
                vec![SessionAction::SignMessage {
                    path: self.key_path,
                    message,
                }]
            }

            (StateKind::AwaitingSignature | StateKind::AwaitingPin, DeviceEvent::Detached) if self.started => {
                self.enter(SessionState::Failed(SigningFailure::DeviceDisconnected));
                Vec::new()
            }

            (StateKind::AwaitingSignature, DeviceEvent::PinRequested(PinRequestKind::Current)) => {
                self.enter(SessionState::AwaitingPin);
                vec![SessionAction::RequestPin]
            }

            (StateKind::AwaitingSignature, DeviceEvent::PinRequested(kind)) => {
                self.enter(SessionState::Failed(SigningFailure::UnexpectedPinRequest(kind)));
                Vec::new()
            }

            (StateKind::AwaitingSignature, DeviceEvent::MessageSignature(bytes)) => {
                let next = self.check_signature(&bytes);
                self.enter(next);
                Vec::new()
            }

            (state, event) => {
                debug!(?state, ?event, "event has no effect in this state");
                Vec::new()
            }
        }
    }

    /// The PIN asked for by [`SessionAction::RequestPin`] was sent to the device.
    pub fn pin_submitted(&mut self) {
        if self.state.kind() == StateKind::AwaitingPin {
            self.enter(SessionState::AwaitingSignature);
        }
    }

    fn check_signature(&self, bytes: &[u8]) -> SessionState {
        let recovered = RecoverableSignature::from_bytes(bytes)
            .and_then(|sig| sig.recover(&self.hash).map(|key| (sig, key)));

        match (recovered, &self.expected) {
            (Err(e), expected) => {
                debug!(error = %e, "no key recoverable from device signature");
                SessionState::Failed(SigningFailure::MismatchedKey {
                    expected: expected.clone(),
                    actual: None,
                })
            }
            (Ok((_, actual)), Some(expected)) if &actual != expected => {
                SessionState::Failed(SigningFailure::MismatchedKey {
                    expected: Some(expected.clone()),
                    actual: Some(actual),
                })
            }
            (Ok((sig, _)), _) => SessionState::Completed(sig),
        }
    }

    fn enter(&mut self, next: SessionState) {
        let from = self.state.kind();
        let to = next.kind();
        debug_assert!(from.can_transition_to(to), "invalid transition {:?} -> {:?}", from, to);
        debug!(?from, ?to, "signing session transition");
        self.state = next;
        self.trace.push(to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::sign_hash;
    use k256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    const HASH: [u8; 32] = [0x42; 32];

    fn key() -> (SigningKey, PublicKey) {
        let key = SigningKey::random(&mut OsRng);
        let public = PublicKey::from_verifying_key(key.verifying_key().clone());
        (key, public)
    }

    fn signature(key: &SigningKey) -> Vec<u8> {
        sign_hash(key, &HASH).unwrap().to_bytes().to_vec()
    }

    fn ready() -> DeviceEvent {
        DeviceEvent::Ready { wallet_present: true }
    }

    #[test]
    fn test_transition_table() {
        use StateKind::*;
        assert!(AwaitingDevice.can_transition_to(DeviceReady));
        assert!(AwaitingSignature.can_transition_to(AwaitingPin));
        assert!(AwaitingPin.can_transition_to(AwaitingSignature));
        assert!(!AwaitingDevice.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(AwaitingSignature));
    }

    #[test]
    fn test_no_keys_on_device() {
        let mut session = SigningSession::new(HASH, None, KeyPath::default());
        assert!(session.handle(DeviceEvent::Ready { wallet_present: false }).is_empty());

        assert_eq!(
            session.outcome(),
            Some(SessionOutcome::Failed(SigningFailure::NoKeysOnDevice))
        );
        assert_eq!(session.trace(), &[StateKind::AwaitingDevice, StateKind::Failed]);
    }

    #[test]
    fn test_detached_before_start_waits() {
        let mut session = SigningSession::new(HASH, None, KeyPath::default());
        assert_eq!(session.handle(DeviceEvent::Detached), vec![SessionAction::AskToPlugIn]);
        assert_eq!(session.state(), &SessionState::AwaitingDevice);
        assert!(!session.is_resolved());
    }

    #[test]
    fn test_ready_issues_sign_message() {
        let mut session = SigningSession::new(HASH, None, KeyPath::default());
        let actions = session.handle(ready());

        assert_eq!(
            actions,
            vec![SessionAction::SignMessage {
                path: KeyPath::default(),
                message: "42".repeat(32),
            }]
        );
        assert_eq!(
            session.trace(),
            &[
                StateKind::AwaitingDevice,
                StateKind::DeviceReady,
                StateKind::AwaitingSignature
            ]
        );
    }

    #[test]
    fn test_device_disconnected_after_start() {
        let mut session = SigningSession::new(HASH, None, KeyPath::default());
        session.handle(ready());
        session.handle(DeviceEvent::Detached);

        assert_eq!(
            session.outcome(),
            Some(SessionOutcome::Failed(SigningFailure::DeviceDisconnected))
        );
    }

    #[test]
    fn test_disconnect_while_awaiting_pin() {
        let mut session = SigningSession::new(HASH, None, KeyPath::default());
        session.handle(ready());
        session.handle(DeviceEvent::PinRequested(PinRequestKind::Current));
        session.handle(DeviceEvent::Detached);

        assert_eq!(
            session.outcome(),
            Some(SessionOutcome::Failed(SigningFailure::DeviceDisconnected))
        );
    }

    #[test]
    fn test_unexpected_pin_request() {
        let mut session = SigningSession::new(HASH, None, KeyPath::default());
        session.handle(ready());
        session.handle(DeviceEvent::PinRequested(PinRequestKind::NewFirst));

        assert_eq!(
            session.outcome(),
            Some(SessionOutcome::Failed(SigningFailure::UnexpectedPinRequest(
                PinRequestKind::NewFirst
            )))
        );
    }

    #[test]
    fn test_mismatched_key() {
        let (signing, _) = key();
        let (_, other) = key();
        let mut session = SigningSession::new(HASH, Some(other.clone()), KeyPath::default());
        session.handle(ready());
        session.handle(DeviceEvent::MessageSignature(signature(&signing)));

        match session.outcome() {
            Some(SessionOutcome::Failed(SigningFailure::MismatchedKey { expected, actual })) => {
                assert_eq!(expected, Some(other));
                assert!(actual.is_some());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_unrecoverable_signature_is_mismatch() {
        let mut session = SigningSession::new(HASH, None, KeyPath::default());
        session.handle(ready());
        session.handle(DeviceEvent::MessageSignature(vec![0u8; 12]));

        assert!(matches!(
            session.outcome(),
            Some(SessionOutcome::Failed(SigningFailure::MismatchedKey { actual: None, .. }))
        ));
    }

    #[test]
    fn test_completed_after_pin() {
        let (signing, public) = key();
        let mut session = SigningSession::new(HASH, Some(public.clone()), KeyPath::default());

        session.handle(ready());
        let actions = session.handle(DeviceEvent::PinRequested(PinRequestKind::Current));
        assert_eq!(actions, vec![SessionAction::RequestPin]);
        session.pin_submitted();
        session.handle(DeviceEvent::MessageSignature(signature(&signing)));

        match session.outcome() {
            Some(SessionOutcome::Completed(sig)) => assert_eq!(sig.recover(&HASH).unwrap(), public),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            session.trace(),
            &[
                StateKind::AwaitingDevice,
                StateKind::DeviceReady,
                StateKind::AwaitingSignature,
                StateKind::AwaitingPin,
                StateKind::AwaitingSignature,
                StateKind::Completed,
            ]
        );
    }

    #[test]
    fn test_events_after_resolution_ignored() {
        let (signing, _) = key();
        let mut session = SigningSession::new(HASH, None, KeyPath::default());
        session.handle(ready());
        session.handle(DeviceEvent::MessageSignature(signature(&signing)));
        let resolved = session.outcome();

        assert!(session.handle(DeviceEvent::Detached).is_empty());
        assert!(session.handle(ready()).is_empty());
        assert_eq!(session.outcome(), resolved);
        assert_eq!(session.trace().len(), 4);
    }
}
