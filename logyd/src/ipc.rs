//! The command socket: newline-delimited JSON over a Unix domain socket, one
//! response line per request line.

use std::{io, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream, unix::OwnedWriteHalf},
};
use tracing::{debug, trace, warn};

use crate::{
    dispatcher::{ConfigureOutcome, Dispatcher},
    error::{DaemonError, ErrorKind},
    registry::{DeviceEntry, Snapshot},
};

/// The longest request line a client may send, newline included.
pub const MAX_REQUEST_LEN: usize = 64 * 1024;

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Request {
    Show,
    Configure {
        device: String,
        setting: String,
        value: String,
    },
    Pair {
        receiver: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    CancelPair {
        receiver: String,
    },
    Unpair {
        device: String,
    },
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Reply {
    Snapshot(Snapshot),
    Configured(ConfigureOutcome),
    Paired(DeviceEntry),
    PairingCancelled { cancelled: bool },
    Unpaired(DeviceEntry),
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Response {
    Ok { result: Reply },
    Error { kind: ErrorKind, message: String },
}

impl From<Result<Reply, DaemonError>> for Response {
    fn from(result: Result<Reply, DaemonError>) -> Self {
        match result {
            Ok(result) => Self::Ok {
                result,
            },
            Err(err) => Self::Error {
                kind: err.kind(),
                message: error_chain(&err),
            },
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Accepts clients on the socket at `path` until the returned task is
/// aborted. A stale socket file is replaced.
pub fn serve(path: &Path, dispatcher: Arc<Dispatcher>) -> io::Result<tokio::task::JoinHandle<()>> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {},
        Err(err) => return Err(err),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    debug!(path = %path.display(), "listening for commands");

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(handle_client(stream, Arc::clone(&dispatcher)));
                },
                Err(err) => warn!("could not accept a client: {err}"),
            }
        }
    }))
}

async fn handle_client(stream: UnixStream, dispatcher: Arc<Dispatcher>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_REQUEST_LEN as u64)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {},
            Err(err) => {
                debug!("client connection failed: {err}");
                break;
            },
        }

        if buf.len() >= MAX_REQUEST_LEN && buf.last() != Some(&b'\n') {
            // The rest of the line cannot be skipped reliably.
            warn!("dropping a client sending an oversized request");
            let response = Response::from(Err(DaemonError::Protocol(format!(
                "requests are limited to {MAX_REQUEST_LEN} bytes"
            ))));
            respond(&mut writer, &response).await;
            break;
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        trace!(%line, "request");

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => dispatcher.handle(request).await,
            Err(err) => Response::from(Err(DaemonError::Protocol(format!(
                "malformed request: {err}"
            )))),
        };

        if !respond(&mut writer, &response).await {
            break;
        }
    }
}

/// Writes one response line. Returns whether the client is still there.
async fn respond(writer: &mut OwnedWriteHalf, response: &Response) -> bool {
    let mut data = match serde_json::to_vec(response) {
        Ok(data) => data,
        Err(err) => {
            warn!("could not serialize a response: {err}");
            return false;
        },
    };
    data.push(b'\n');

    if let Err(err) = writer.write_all(&data).await {
        debug!("could not answer the client: {err}");
        return false;
    }
    true
}

/// Sends one request to the daemon listening at `socket` and waits for its
/// response.
pub async fn request(socket: &Path, request: &Request) -> io::Result<Response> {
    let stream = UnixStream::connect(socket).await.map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("could not connect to {}: {err}", socket.display()),
        )
    })?;
    let (reader, mut writer) = stream.into_split();

    let mut data = serde_json::to_vec(request).map_err(io::Error::other)?;
    data.push(b'\n');
    writer.write_all(&data).await?;

    let line = BufReader::new(reader)
        .lines()
        .next_line()
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "the daemon hung up"))?;

    serde_json::from_str(&line).map_err(io::Error::other)
}

/// Removes the socket file, if it is still there.
pub fn remove_socket(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), "could not remove the socket: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_use_the_command_tag() {
        let request: Request = serde_json::from_str(
            r#"{"command":"configure","device":"4A1B2C01","setting":"scroll-invert","value":"on"}"#,
        )
        .unwrap();
        assert_eq!(request, Request::Configure {
            device: "4A1B2C01".to_string(),
            setting: "scroll-invert".to_string(),
            value: "on".to_string(),
        });

        let pair: Request = serde_json::from_str(r#"{"command":"pair","receiver":"R"}"#).unwrap();
        assert_eq!(pair, Request::Pair {
            receiver: "R".to_string(),
            timeout_secs: None,
        });
    }

    #[test]
    fn errors_carry_their_kind() {
        let response = Response::from(Err(DaemonError::DeviceNotFound("X".to_string())));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["kind"], "device-not-found");
    }
}
