mod common;

use std::time::Duration;

use common::Harness;
use hidpp::testing::{SimulatedDevice, SimulatedReceiver};
use logyd::{error::ErrorKind, pairing::PairingPhase, registry::ConnectionState};

#[tokio::test(start_paused = true)]
async fn pairs_a_discovered_device() {
    let harness = Harness::start([]).await;
    let receiver = harness.receiver_id();
    let keyboard = SimulatedDevice::keyboard(1);

    let dispatcher = harness.dispatcher();
    let id = receiver.clone();
    let attempt =
        tokio::spawn(async move { dispatcher.pair(&id, Some(Duration::from_secs(30))).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    harness
        .handle
        .inject(SimulatedReceiver::discovery_name(1, &keyboard.name));
    harness
        .handle
        .inject(SimulatedReceiver::discovery_details(1, &keyboard, 0x01));
    harness
        .handle
        .inject(SimulatedReceiver::passkey_request(keyboard.address, "482916"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pairing = harness
        .dispatcher()
        .registry()
        .receiver(&receiver)
        .unwrap()
        .pairing
        .unwrap();
    assert_eq!(pairing.phase, PairingPhase::Confirming);
    assert_eq!(pairing.passkey.as_deref(), Some("482916"));
    assert_eq!(pairing.candidate.unwrap().name.as_deref(), Some("MX Keys S"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    harness.sim.add_device(keyboard.clone());
    harness
        .handle
        .inject(SimulatedReceiver::pairing_status(keyboard.address, 0, 1));

    let device = attempt.await.unwrap().unwrap();
    assert_eq!(device.identity, keyboard.serial());
    assert_eq!(device.slot, 1);
    assert_eq!(device.state, ConnectionState::Connected);
    assert_eq!(harness.close_lock_count(), 1);

    let pairing = harness
        .dispatcher()
        .registry()
        .receiver(&receiver)
        .unwrap()
        .pairing
        .unwrap();
    assert_eq!(pairing.phase, PairingPhase::Paired {
        slot: 1
    });
    assert!(harness.dispatcher().registry().find_device(&keyboard.serial()).is_some());
}

#[tokio::test(start_paused = true)]
async fn pairing_times_out_without_candidates() {
    let harness = Harness::start([]).await;

    let err = harness
        .dispatcher()
        .pair(&harness.receiver_id(), Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(harness.close_lock_count(), 1);
    assert!(harness.dispatcher().show().receivers[0].devices.is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_attempt_is_rejected_and_the_first_can_be_cancelled() {
    let harness = Harness::start([]).await;
    let receiver = harness.receiver_id();

    let dispatcher = harness.dispatcher();
    let id = receiver.clone();
    let first = tokio::spawn(async move { dispatcher.pair(&id, None).await });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let err = harness.dispatcher().pair(&receiver, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyPairing);

    assert!(harness.dispatcher().cancel_pair(&receiver).unwrap());
    let err = first.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(harness.close_lock_count(), 1);

    assert!(!harness.dispatcher().cancel_pair(&receiver).unwrap());
}

#[tokio::test(start_paused = true)]
async fn pairing_fails_on_a_foreign_status() {
    let harness = Harness::start([]).await;
    let receiver = harness.receiver_id();
    let mouse = SimulatedDevice::mouse(2);

    let dispatcher = harness.dispatcher();
    let id = receiver.clone();
    let attempt = tokio::spawn(async move { dispatcher.pair(&id, None).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    harness
        .handle
        .inject(SimulatedReceiver::discovery_details(7, &mouse, 0x00));
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness
        .handle
        .inject(SimulatedReceiver::pairing_status([0x01, 0x02, 0x03, 0x04, 0x05, 0x06], 0, 2));

    let err = attempt.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);
    assert_eq!(harness.close_lock_count(), 1);
    assert!(harness.dispatcher().registry().find_device(&mouse.serial()).is_none());
}

#[tokio::test(start_paused = true)]
async fn pairing_timeouts_are_bounded() {
    let harness = Harness::start([]).await;

    for timeout in [Duration::ZERO, Duration::from_secs(61)] {
        let err = harness
            .dispatcher()
            .pair(&harness.receiver_id(), Some(timeout))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSetting);
    }
    assert_eq!(harness.close_lock_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn pairing_times_out_while_confirming() {
    let harness = Harness::start([]).await;
    let receiver = harness.receiver_id();
    let keyboard = SimulatedDevice::keyboard(1);

    let dispatcher = harness.dispatcher();
    let id = receiver.clone();
    let attempt =
        tokio::spawn(async move { dispatcher.pair(&id, Some(Duration::from_secs(3))).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    harness
        .handle
        .inject(SimulatedReceiver::discovery_details(1, &keyboard, 0x01));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let pairing = harness.dispatcher().registry().receiver(&receiver).unwrap().pairing.unwrap();
    assert_eq!(pairing.phase, PairingPhase::Confirming);

    let err = attempt.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(harness.close_lock_count(), 1);
}
