mod common;

use common::Harness;
use hidpp::testing::SimulatedDevice;
use logyd::{
    error::ErrorKind,
    ipc::{self, Reply, Request, Response},
    settings::{Setting, SettingValue},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
};

#[tokio::test]
async fn answers_commands_over_the_socket() {
    let mouse = SimulatedDevice::mouse(1);
    let harness = Harness::start([mouse.clone()]).await;
    let socket = harness.state.path().join("logyd.sock");
    let server = ipc::serve(&socket, harness.dispatcher()).unwrap();

    let Response::Ok {
        result: Reply::Snapshot(snapshot),
    } = ipc::request(&socket, &Request::Show).await.unwrap()
    else {
        panic!("expected a snapshot");
    };
    assert_eq!(snapshot.receivers[0].devices[0].identity, mouse.serial());

    let response = ipc::request(&socket, &Request::Configure {
        device: mouse.serial(),
        setting: "hires-scroll".to_string(),
        value: "on".to_string(),
    })
    .await
    .unwrap();
    let Response::Ok {
        result: Reply::Configured(outcome),
    } = response
    else {
        panic!("expected a configure outcome, got {response:?}");
    };
    assert!(outcome.applied);
    assert_eq!(
        outcome.device.settings.get(&Setting::HiresScroll),
        Some(&SettingValue::Flag(true))
    );

    let response = ipc::request(&socket, &Request::Configure {
        device: mouse.serial(),
        setting: "hires-scroll".to_string(),
        value: "sideways".to_string(),
    })
    .await
    .unwrap();
    assert!(matches!(response, Response::Error {
        kind: ErrorKind::InvalidSetting,
        ..
    }));

    let response = ipc::request(&socket, &Request::CancelPair {
        receiver: harness.receiver_id(),
    })
    .await
    .unwrap();
    assert_eq!(response, Response::Ok {
        result: Reply::PairingCancelled {
            cancelled: false
        },
    });

    server.abort();
    ipc::remove_socket(&socket);
}

#[tokio::test]
async fn malformed_lines_are_answered_with_errors() {
    let harness = Harness::start([]).await;
    let socket = harness.state.path().join("logyd.sock");
    let server = ipc::serve(&socket, harness.dispatcher()).unwrap();

    let stream = UnixStream::connect(&socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"{\"command\":\"dance\"}\n").await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let response: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["status"], "error");
    assert_eq!(response["kind"], "protocol-error");

    // The connection stays usable.
    writer.write_all(b"{\"command\":\"show\"}\n").await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let response: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["status"], "ok");
    assert_eq!(response["result"]["type"], "snapshot");

    server.abort();
}

#[tokio::test]
async fn oversized_requests_drop_the_client() {
    let harness = Harness::start([]).await;
    let socket = harness.state.path().join("logyd.sock");
    let server = ipc::serve(&socket, harness.dispatcher()).unwrap();

    let stream = UnixStream::connect(&socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(&vec![b'a'; ipc::MAX_REQUEST_LEN]).await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let response: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["status"], "error");
    assert_eq!(response["kind"], "protocol-error");
    assert!(!matches!(lines.next_line().await, Ok(Some(_))));

    // Other clients are still served.
    let response = ipc::request(&socket, &Request::Show).await.unwrap();
    assert!(matches!(response, Response::Ok {
        result: Reply::Snapshot(_)
    }));

    server.abort();
}
