//! Pairing new devices to a receiver.
//!
//! [`PairingFsm`] holds the state of one pairing attempt and turns inputs
//! into the actions to perform. [`run`] feeds it with receiver notifications,
//! cancellation and the deadline, and performs the actions on a session.

use std::{collections::VecDeque, time::Duration};

use hidpp::{
    channel::SessionEvent,
    receiver::bolt::{BoltDeviceKind, BoltEvent},
};
use serde::{Deserialize, Serialize};
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, info, warn};

use crate::{error::DaemonError, registry::DeviceEntry, session::ReceiverSession};

/// Passkey complexity requested for keyboards, which have digits to type.
const KEYBOARD_ENTROPY: u8 = 20;
const DEFAULT_ENTROPY: u8 = 10;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    Timeout,

    /// A different device than the candidate finished pairing.
    AddressMismatch,

    /// The receiver reported a pairing error.
    Rejected,

    /// Talking to the receiver failed.
    Io,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "kebab-case")]
pub enum PairingPhase {
    Idle,
    Listening,
    CandidateFound,
    Confirming,
    Paired { slot: u8 },
    Failed { reason: FailureReason },
    Cancelled,
}

impl PairingPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paired { .. } | Self::Failed { .. } | Self::Cancelled)
    }
}

/// A device found while the pairing lock is open.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Candidate {
    pub counter: u16,
    pub address: [u8; 6],
    pub kind: BoltDeviceKind,
    pub wpid: u16,
    pub authentication: u8,

    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PairingInput {
    Start,
    Discovered(Candidate),
    DiscoveredName { counter: u16, name: String },
    DiscoveryStopped,
    Status {
        address: [u8; 6],
        error: bool,
        slot: Option<u8>,
    },
    Passkey { address: [u8; 6], passkey: String },

    /// The receiver acknowledged the request to pair the candidate.
    Accepted,
    Cancel,
    DeadlineExpired,

    /// An action could not be performed.
    Failed,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PairingAction {
    OpenLock,
    Pair {
        address: [u8; 6],
        authentication: u8,
        entropy: u8,
    },
    ReportPasskey(String),
    Materialize { slot: u8 },
    CloseLock,
}

/// What clients see of a pairing attempt.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PairingView {
    #[serde(flatten)]
    pub phase: PairingPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passkey: Option<String>,
}

#[derive(Debug)]
pub struct PairingFsm {
    phase: PairingPhase,
    candidate: Option<Candidate>,

    /// A name announced before the details of its device.
    pending_name: Option<(u16, String)>,

    passkey: Option<String>,
    lock_open: bool,
}

impl Default for PairingFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingFsm {
    pub fn new() -> Self {
        Self {
            phase: PairingPhase::Idle,
            candidate: None,
            pending_name: None,
            passkey: None,
            lock_open: false,
        }
    }

    pub fn phase(&self) -> PairingPhase {
        self.phase
    }

    pub fn candidate(&self) -> Option<&Candidate> {
        self.candidate.as_ref()
    }

    pub fn view(&self) -> PairingView {
        PairingView {
            phase: self.phase,
            candidate: self.candidate.clone(),
            passkey: self.passkey.clone(),
        }
    }

    /// Advances the state machine and returns the actions to perform, in
    /// order.
    pub fn apply(&mut self, input: PairingInput) -> Vec<PairingAction> {
        use PairingPhase::*;

        if self.phase.is_terminal() {
            return Vec::new();
        }

        match (self.phase, input) {
            (Idle, PairingInput::Start) => {
                self.phase = Listening;
                self.lock_open = true;
                vec![PairingAction::OpenLock]
            },
            (Listening, PairingInput::Discovered(mut candidate)) => {
                if let Some((counter, name)) = self.pending_name.take() {
                    if counter == candidate.counter {
                        candidate.name = Some(name);
                    }
                }

                let action = PairingAction::Pair {
                    address: candidate.address,
                    authentication: candidate.authentication,
                    entropy: match candidate.kind {
                        BoltDeviceKind::Keyboard => KEYBOARD_ENTROPY,
                        _ => DEFAULT_ENTROPY,
                    },
                };

                // The first candidate is accepted right away.
                self.candidate = Some(candidate);
                self.phase = CandidateFound;
                vec![action]
            },
            (CandidateFound, PairingInput::Accepted) => {
                self.phase = Confirming;
                Vec::new()
            },
            (Listening, PairingInput::DiscoveredName { counter, name }) => {
                self.pending_name = Some((counter, name));
                Vec::new()
            },
            (CandidateFound | Confirming, PairingInput::DiscoveredName { counter, name }) => {
                if let Some(candidate) = self.candidate.as_mut() {
                    if candidate.counter == counter {
                        candidate.name = Some(name);
                    }
                }
                Vec::new()
            },
            (Listening, PairingInput::DiscoveryStopped) => {
                self.fail(FailureReason::Timeout)
            },
            (CandidateFound | Confirming, PairingInput::Status { address, error, slot }) => {
                let expected = self.candidate.as_ref().map(|candidate| candidate.address);

                if expected != Some(address) {
                    return self.fail(FailureReason::AddressMismatch);
                }
                if error {
                    return self.fail(FailureReason::Rejected);
                }

                match slot {
                    Some(slot) => {
                        self.phase = Paired {
                            slot,
                        };
                        let mut actions: Vec<_> = self.close_lock().into_iter().collect();
                        actions.push(PairingAction::Materialize {
                            slot,
                        });
                        actions
                    },
                    // An intermediate status.
                    None => Vec::new(),
                }
            },
            (CandidateFound | Confirming, PairingInput::Passkey { address, passkey }) => {
                if self.candidate.as_ref().map(|candidate| candidate.address) != Some(address) {
                    return Vec::new();
                }
                self.passkey = Some(passkey.clone());
                vec![PairingAction::ReportPasskey(passkey)]
            },
            (_, PairingInput::Cancel) => {
                self.phase = Cancelled;
                self.close_lock().into_iter().collect()
            },
            (Listening | CandidateFound | Confirming, PairingInput::DeadlineExpired) => {
                self.fail(FailureReason::Timeout)
            },
            (_, PairingInput::Failed) => self.fail(FailureReason::Io),
            _ => Vec::new(),
        }
    }

    fn fail(&mut self, reason: FailureReason) -> Vec<PairingAction> {
        self.phase = PairingPhase::Failed {
            reason,
        };
        self.close_lock().into_iter().collect()
    }

    fn close_lock(&mut self) -> Option<PairingAction> {
        std::mem::take(&mut self.lock_open).then_some(PairingAction::CloseLock)
    }
}

impl PairingInput {
    /// Maps a receiver notification to an input, if it is relevant to
    /// pairing.
    pub fn from_event(event: BoltEvent) -> Option<Self> {
        match event {
            BoltEvent::DeviceDiscoveryDeviceDetails(details) => {
                Some(Self::Discovered(Candidate {
                    counter: details.counter,
                    address: details.address,
                    kind: details.kind,
                    wpid: details.wpid,
                    authentication: details.authentication,
                    name: None,
                }))
            },
            BoltEvent::DeviceDiscoveryDeviceName(name) => Some(Self::DiscoveredName {
                counter: name.counter,
                name: name.name,
            }),
            BoltEvent::DeviceDiscoveryStatus(status) if !status.discovery_enabled => {
                Some(Self::DiscoveryStopped)
            },
            BoltEvent::PairingStatus(status) => Some(Self::Status {
                address: status.device_address,
                error: status.pairing_error.is_some(),
                slot: status.slot,
            }),
            BoltEvent::PairingPasskeyRequest(request) => Some(Self::Passkey {
                address: request.device_address,
                passkey: request.passkey,
            }),
            _ => None,
        }
    }
}

/// Runs one pairing attempt on `session` until it ends.
///
/// The caller holds the receiver's exclusive section. Resolves with the newly
/// paired device.
pub async fn run(
    session: &ReceiverSession,
    timeout: Duration,
    mut cancel: oneshot::Receiver<()>,
) -> Result<DeviceEntry, DaemonError> {
    let events = session.channel().listen();
    let deadline = Instant::now() + timeout;
    let lock_secs = u8::try_from(timeout.as_secs().max(1)).unwrap_or(u8::MAX);

    let mut fsm = PairingFsm::new();
    let mut inputs = VecDeque::from([PairingInput::Start]);
    let mut paired = None;
    let mut last_error = None;

    info!(receiver = session.id(), ?timeout, "pairing started");

    loop {
        while let Some(input) = inputs.pop_front() {
            debug!(receiver = session.id(), ?input, "pairing input");

            for action in fsm.apply(input) {
                let accepts = matches!(action, PairingAction::Pair { .. });

                match perform(session, action, lock_secs).await {
                    Ok(Some(device)) => paired = Some(device),
                    Ok(None) if accepts => inputs.push_back(PairingInput::Accepted),
                    Ok(None) => {},
                    Err(err) => {
                        warn!(receiver = session.id(), "pairing step failed: {err}");
                        last_error = Some(err);
                        inputs.push_back(PairingInput::Failed);
                    },
                }
            }

            session
                .registry()
                .set_pairing(session.id(), Some(fsm.view()));
        }

        if fsm.phase().is_terminal() {
            break;
        }

        let input = tokio::select! {
            _ = &mut cancel => PairingInput::Cancel,
            () = tokio::time::sleep_until(deadline) => PairingInput::DeadlineExpired,
            event = events.recv_async() => match event {
                Ok(SessionEvent::Notification(frame)) => {
                    match BoltEvent::parse(&frame).and_then(PairingInput::from_event) {
                        Some(input) => input,
                        None => continue,
                    }
                },
                Ok(SessionEvent::TransportLost(reason)) => {
                    last_error = Some(DaemonError::DeviceUnreachable);
                    warn!(receiver = session.id(), "receiver lost while pairing: {reason}");
                    PairingInput::Failed
                },
                // The session was closed.
                Err(_) => PairingInput::Cancel,
            },
        };
        inputs.push_back(input);
    }

    let phase = fsm.phase();
    info!(receiver = session.id(), ?phase, "pairing finished");

    match phase {
        PairingPhase::Paired { slot } => match paired {
            Some(device) => Ok(device),
            None => Err(last_error.unwrap_or_else(|| {
                DaemonError::DeviceNotFound(format!("{}/{slot}", session.id()))
            })),
        },
        PairingPhase::Failed {
            reason: FailureReason::Timeout,
        } => Err(DaemonError::Timeout),
        PairingPhase::Failed {
            reason: FailureReason::AddressMismatch,
        } => Err(DaemonError::Protocol(
            "a different device than the candidate was paired".to_string(),
        )),
        PairingPhase::Failed {
            reason: FailureReason::Rejected,
        } => Err(DaemonError::Protocol("the receiver rejected the pairing".to_string())),
        PairingPhase::Failed {
            reason: FailureReason::Io,
        } => Err(last_error.unwrap_or(DaemonError::DeviceUnreachable)),
        _ => Err(DaemonError::Cancelled),
    }
}

async fn perform(
    session: &ReceiverSession,
    action: PairingAction,
    lock_secs: u8,
) -> Result<Option<DeviceEntry>, DaemonError> {
    match action {
        PairingAction::OpenLock => session.bolt().discover_devices(Some(lock_secs)).await?,
        PairingAction::Pair {
            address,
            authentication,
            entropy,
        } => {
            // Slot zero lets the receiver pick a free slot.
            session
                .bolt()
                .pair_device(0, address, authentication, entropy)
                .await?
        },
        PairingAction::ReportPasskey(passkey) => {
            info!(receiver = session.id(), %passkey, "enter the passkey on the device to pair");
        },
        PairingAction::Materialize {
            slot,
        } => return session.adopt_device(slot).await.map(Some),
        PairingAction::CloseLock => session.bolt().cancel_device_discovery().await?,
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(kind: BoltDeviceKind) -> Candidate {
        Candidate {
            counter: 7,
            address: [0xc0, 0xff, 0xee, 0x00, 0x00, 0x03],
            kind,
            wpid: 0xb034,
            authentication: 0x0a,
            name: None,
        }
    }

    fn close_count(actions: &[PairingAction]) -> usize {
        actions
            .iter()
            .filter(|action| **action == PairingAction::CloseLock)
            .count()
    }

    #[test]
    fn pairs_the_first_candidate() {
        let mut fsm = PairingFsm::new();
        assert_eq!(fsm.apply(PairingInput::Start), [PairingAction::OpenLock]);
        assert_eq!(fsm.phase(), PairingPhase::Listening);

        assert!(
            fsm.apply(PairingInput::DiscoveredName {
                counter: 7,
                name: "MX Master 3S".to_string(),
            })
            .is_empty()
        );
        assert_eq!(fsm.apply(PairingInput::Discovered(candidate(BoltDeviceKind::Mouse))), [
            PairingAction::Pair {
                address: [0xc0, 0xff, 0xee, 0x00, 0x00, 0x03],
                authentication: 0x0a,
                entropy: DEFAULT_ENTROPY,
            }
        ]);
        assert_eq!(fsm.phase(), PairingPhase::CandidateFound);
        assert!(fsm.apply(PairingInput::Accepted).is_empty());
        assert_eq!(fsm.phase(), PairingPhase::Confirming);
        assert_eq!(fsm.candidate().unwrap().name.as_deref(), Some("MX Master 3S"));

        let actions = fsm.apply(PairingInput::Status {
            address: [0xc0, 0xff, 0xee, 0x00, 0x00, 0x03],
            error: false,
            slot: Some(3),
        });
        assert_eq!(actions, [PairingAction::CloseLock, PairingAction::Materialize {
            slot: 3
        }]);
        assert_eq!(fsm.phase(), PairingPhase::Paired {
            slot: 3
        });

        assert!(fsm.apply(PairingInput::Cancel).is_empty());
    }

    #[test]
    fn keyboards_get_more_entropy() {
        let mut fsm = PairingFsm::new();
        fsm.apply(PairingInput::Start);
        let actions = fsm.apply(PairingInput::Discovered(candidate(BoltDeviceKind::Keyboard)));
        assert!(matches!(actions[..], [PairingAction::Pair {
            entropy: KEYBOARD_ENTROPY,
            ..
        }]));
    }

    #[test]
    fn deadline_closes_the_lock_once() {
        let mut fsm = PairingFsm::new();
        fsm.apply(PairingInput::Start);

        let actions = fsm.apply(PairingInput::DeadlineExpired);
        assert_eq!(close_count(&actions), 1);
        assert_eq!(fsm.phase(), PairingPhase::Failed {
            reason: FailureReason::Timeout
        });

        assert!(fsm.apply(PairingInput::DeadlineExpired).is_empty());
        assert!(fsm.apply(PairingInput::Cancel).is_empty());
    }

    #[test]
    fn deadline_closes_the_lock_once_after_a_candidate_appeared() {
        for accepted in [false, true] {
            let mut fsm = PairingFsm::new();
            fsm.apply(PairingInput::Start);
            fsm.apply(PairingInput::Discovered(candidate(BoltDeviceKind::Keyboard)));
            if accepted {
                fsm.apply(PairingInput::Accepted);
                assert_eq!(fsm.phase(), PairingPhase::Confirming);
            } else {
                assert_eq!(fsm.phase(), PairingPhase::CandidateFound);
            }

            let actions = fsm.apply(PairingInput::DeadlineExpired);
            assert_eq!(actions, [PairingAction::CloseLock]);
            assert_eq!(fsm.phase(), PairingPhase::Failed {
                reason: FailureReason::Timeout
            });

            assert!(fsm.apply(PairingInput::DeadlineExpired).is_empty());
            assert!(fsm.apply(PairingInput::Cancel).is_empty());
            assert!(
                fsm.apply(PairingInput::Status {
                    address: [0xc0, 0xff, 0xee, 0x00, 0x00, 0x03],
                    error: false,
                    slot: Some(1),
                })
                .is_empty()
            );
        }
    }

    #[test]
    fn foreign_device_fails_the_attempt() {
        let mut fsm = PairingFsm::new();
        fsm.apply(PairingInput::Start);
        fsm.apply(PairingInput::Discovered(candidate(BoltDeviceKind::Mouse)));

        let actions = fsm.apply(PairingInput::Status {
            address: [1, 2, 3, 4, 5, 6],
            error: false,
            slot: Some(2),
        });
        assert_eq!(actions, [PairingAction::CloseLock]);
        assert_eq!(fsm.phase(), PairingPhase::Failed {
            reason: FailureReason::AddressMismatch
        });
    }

    #[test]
    fn cancel_before_the_lock_opened_sends_nothing() {
        let mut fsm = PairingFsm::new();
        assert!(fsm.apply(PairingInput::Cancel).is_empty());
        assert_eq!(fsm.phase(), PairingPhase::Cancelled);

        let mut fsm = PairingFsm::new();
        fsm.apply(PairingInput::Start);
        assert_eq!(fsm.apply(PairingInput::Cancel), [PairingAction::CloseLock]);
    }

    #[test]
    fn passkeys_are_reported_for_the_candidate_only() {
        let mut fsm = PairingFsm::new();
        fsm.apply(PairingInput::Start);
        fsm.apply(PairingInput::Discovered(candidate(BoltDeviceKind::Keyboard)));

        assert!(
            fsm.apply(PairingInput::Passkey {
                address: [9; 6],
                passkey: "111111".to_string(),
            })
            .is_empty()
        );
        assert_eq!(
            fsm.apply(PairingInput::Passkey {
                address: [0xc0, 0xff, 0xee, 0x00, 0x00, 0x03],
                passkey: "012345".to_string(),
            }),
            [PairingAction::ReportPasskey("012345".to_string())]
        );
        assert_eq!(fsm.view().passkey.as_deref(), Some("012345"));
    }

    #[test]
    fn view_serializes_flat() {
        let mut fsm = PairingFsm::new();
        fsm.apply(PairingInput::Start);
        let json = serde_json::to_value(fsm.view()).unwrap();
        assert_eq!(json, serde_json::json!({ "phase": "listening" }));
    }
}
