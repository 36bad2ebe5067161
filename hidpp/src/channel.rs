//! Implements basic messaging across HID and HID++ channels.
//!
//! A [`HidppChannel`] multiplexes one raw HID channel between request/response
//! exchanges and unsolicited notifications. A single read task decodes every
//! incoming report and either completes the pending exchange it answers or
//! publishes it as a [`SessionEvent`].

use std::{
    collections::HashMap,
    error::Error,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{FutureExt, channel::oneshot, select};
use hidreport::{Field, Report, ReportDescriptor, Usage, UsageId, UsagePage};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{
    event::EventEmitter,
    frame::{
        ErrorFrame,
        Frame,
        FrameHeader,
        LONG_REPORT_ID,
        MAX_REPORT_LENGTH,
        MessageClass,
        ReportKind,
        SHORT_REPORT_ID,
    },
    nibble::U4,
    protocol::{v10, v20},
};

/// hidapi defines this as the maximum EXPECTED size of report descriptors.
const MAX_REPORT_DESCRIPTOR_LENGTH: usize = 4096;

const SHORT_REPORT_USAGE_PAGE: u16 = 0xff00;
const SHORT_REPORT_USAGE: u16 = 0x0001;

const LONG_REPORT_USAGE_PAGE: u16 = 0xff00;
const LONG_REPORT_USAGE: u16 = 0x0002;

/// How long a single transport read may block before the read task checks
/// whether it should stop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The timeout used by [`HidppChannel::send`] callers that don't pass one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Represents an arbitrary HID communication channel that is both readable and
/// writable. It has to support async I/O.
///
/// Any error returned from a read or write is considered terminal: the
/// channel will not be used again and reopening it is up to the owner.
#[async_trait]
pub trait RawHidChannel: Send + Sync + 'static {
    /// The USB vendor ID of the underlying device.
    fn vendor_id(&self) -> u16;

    /// The USB product ID of the underlying device.
    fn product_id(&self) -> u16;

    /// A stable path identifying the device node.
    fn path(&self) -> String;

    /// Writes a raw report to the channel.
    ///
    /// Returns the exact amount of written bytes on success.
    async fn write_report(&self, src: &[u8]) -> Result<usize, TransportError>;

    /// Reads a raw report from the channel, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` if no report arrived in time. If the buffer is not
    /// large enough to fit the whole report, its remainder should be
    /// discarded.
    async fn read_report(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// If the implementation already knows whether the underlying HID channel
    /// supports HID++ messages, it should return `Some((supports_short,
    /// supports_long))` from this method.
    ///
    /// In this case, the report descriptor will not be read and parsed.
    fn supports_short_long_hidpp(&self) -> Option<(bool, bool)>;

    /// Retrieves the raw HID report descriptor from the channel.
    ///
    /// Returns the exact size of the report descriptor on success.
    async fn get_report_descriptor(&self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Represents a failure of the raw HID transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O on the HID node failed")]
    Io(#[from] std::io::Error),

    #[error("the HID backend returned an error: {0}")]
    Backend(Box<dyn Error + Send + Sync>),
}

/// Checks whether a raw channel supports short or long HID++ messages.
async fn supports_short_long_hidpp<T: RawHidChannel>(chan: &T) -> Result<(bool, bool), ChannelError> {
    if let Some(support) = chan.supports_short_long_hidpp() {
        return Ok(support);
    }

    let mut raw_descriptor = vec![0u8; MAX_REPORT_DESCRIPTOR_LENGTH];
    let descriptor_size = chan.get_report_descriptor(&mut raw_descriptor).await?;

    let descriptor = ReportDescriptor::try_from(&raw_descriptor[..descriptor_size])
        .map_err(ChannelError::ReportDescriptor)?;

    let supports = |report_id: u8, page: u16, usage: u16| {
        descriptor
            .find_input_report(&[report_id])
            .and_then(|report| report.fields().first())
            .and_then(|field| match field {
                Field::Array(arr) => Some(arr.usage_range()),
                _ => None,
            })
            .is_some_and(|range| {
                range
                    .lookup_usage(&Usage::from_page_and_id(
                        UsagePage::from(page),
                        UsageId::from(usage),
                    ))
                    .is_some()
            })
    };

    Ok((
        supports(SHORT_REPORT_ID, SHORT_REPORT_USAGE_PAGE, SHORT_REPORT_USAGE),
        supports(LONG_REPORT_ID, LONG_REPORT_USAGE_PAGE, LONG_REPORT_USAGE),
    ))
}

/// Identifies the exchange slot a request occupies.
///
/// HID++2.0 requests are keyed by their function ID, leaving the software ID
/// to act as the request tag. HID++1.0 register accesses echo the register
/// address instead, so the whole byte is part of the key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ExchangeKey {
    pub device_index: u8,
    pub feature_index: u8,
    pub function: u8,
}

impl From<FrameHeader> for ExchangeKey {
    fn from(header: FrameHeader) -> Self {
        let function = if v10::is_register_access(header.feature_index) {
            header.function_and_sw_id
        } else {
            header.function_id().to_lo()
        };

        Self {
            device_index: header.device_index,
            feature_index: header.feature_index,
            function,
        }
    }
}

/// An event published by the read path of a [`HidppChannel`].
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// An unsolicited frame was received.
    Notification(Frame),

    /// The raw channel failed and the session was closed.
    TransportLost(String),
}

/// Why a session stopped accepting requests.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CloseReason {
    Cancelled,
    TransportLost,
}

impl From<CloseReason> for ChannelError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Cancelled => ChannelError::Cancelled,
            CloseReason::TransportLost => ChannelError::DeviceUnreachable,
        }
    }
}

/// How a pending exchange was completed without a regular response.
#[derive(Debug)]
enum ExchangeFailure {
    Error(ErrorFrame),
    Closed(CloseReason),
}

/// Represents a message that was sent and is waiting for a response.
struct PendingExchange {
    /// The exact header the response has to carry.
    expected: FrameHeader,

    /// The oneshot sender used to provide the response to the waiting caller.
    sender: oneshot::Sender<Result<Frame, ExchangeFailure>>,
}

/// State shared between the channel handle and its read task.
struct SessionState {
    /// All sent messages that are waiting for a response.
    pending: Mutex<HashMap<ExchangeKey, PendingExchange>>,

    /// One FIFO lock per exchange key. Holding it grants the right to have a
    /// request for that key in flight.
    key_locks: Mutex<HashMap<ExchangeKey, Arc<tokio::sync::Mutex<()>>>>,

    /// Set once the session was closed, rejecting every further request.
    closed: Mutex<Option<CloseReason>>,

    events: EventEmitter<SessionEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionState {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            closed: Mutex::new(None),
            events: EventEmitter::new(),
        }
    }

    fn key_lock(&self, key: ExchangeKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock(&self.key_locks).entry(key).or_default())
    }

    /// Hands a frame to the exchange waiting for `header`.
    ///
    /// Returns whether such an exchange existed.
    fn complete(&self, header: FrameHeader, result: Result<Frame, ExchangeFailure>) -> bool {
        let key = ExchangeKey::from(header);
        let mut pending = lock(&self.pending);

        match pending.get(&key) {
            Some(waiting) if waiting.expected == header => {
                if let Some(waiting) = pending.remove(&key) {
                    // The caller may already have timed out, which is fine.
                    let _ = waiting.sender.send(result);
                }
                true
            },
            _ => false,
        }
    }

    /// Classifies and routes a raw report read from the transport.
    fn dispatch(&self, data: &[u8]) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(err) => {
                // Receivers also forward regular mouse and keyboard reports.
                trace!("ignoring non-HID++ report: {err}");
                return;
            },
        };

        match frame.class() {
            MessageClass::Error(error) => {
                if !self.complete(error.origin, Err(ExchangeFailure::Error(error))) {
                    warn!(?error, "dropping unexpected error response");
                }
            },
            MessageClass::Response => {
                if !self.complete(frame.header(), Ok(frame)) {
                    warn!(header = ?frame.header(), "dropping unexpected response");
                }
            },
            MessageClass::Notification => {
                if !self.complete(frame.header(), Ok(frame)) {
                    self.events.emit(SessionEvent::Notification(frame));
                }
            },
        }
    }

    /// Rejects every further request and fails all pending exchanges.
    ///
    /// Returns `false` if the session was already closed.
    fn close(&self, reason: CloseReason) -> bool {
        {
            let mut closed = lock(&self.closed);
            if closed.is_some() {
                return false;
            }
            *closed = Some(reason);
        }

        self.fail_pending(reason);
        true
    }

    fn fail_pending(&self, reason: CloseReason) {
        let drained: Vec<PendingExchange> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for waiting in drained {
            let _ = waiting.sender.send(Err(ExchangeFailure::Closed(reason)));
        }
    }

    fn closed(&self) -> Option<CloseReason> {
        *lock(&self.closed)
    }

    /// Registers an exchange unless the session is closed.
    ///
    /// The check happens under the lock of the pending table, so a
    /// concurrent [`Self::close`] either sees the exchange or is seen here.
    fn register(&self, key: ExchangeKey, exchange: PendingExchange) -> Result<(), CloseReason> {
        let mut pending = lock(&self.pending);
        if let Some(reason) = self.closed() {
            return Err(reason);
        }

        pending.insert(key, exchange);
        Ok(())
    }
}

/// Represents a HID communication channel supporting HID++.
///
/// Creating a channel spawns its read task on the current Tokio runtime.
pub struct HidppChannel {
    /// Whether the channel supports short (7 bytes) HID++ messages.
    pub supports_short: bool,

    /// Whether the channel supports long (20 bytes) HID++ messages.
    pub supports_long: bool,

    /// The USB vendor ID of the underlying device.
    pub vendor_id: u16,

    /// The USB product ID of the underlying device.
    pub product_id: u16,

    /// The path of the HID node the channel was opened on.
    pub path: String,

    /// The underlying raw HID channel.
    raw_channel: Arc<dyn RawHidChannel>,

    state: Arc<SessionState>,

    /// The software ID the next HID++2.0 request will be tagged with.
    next_sw_id: AtomicU8,

    /// The timeout used by the protocol helpers.
    timeout: Mutex<Duration>,

    /// The sender signaling the read task to stop.
    read_task_close: Mutex<Option<oneshot::Sender<()>>>,
}

impl Drop for HidppChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl HidppChannel {
    /// Tries to construct a HID++ channel from a raw HID channel, using
    /// [`DEFAULT_POLL_INTERVAL`] for the read task.
    ///
    /// If the given HID channel does not support HID++,
    /// [`ChannelError::HidppNotSupported`] will be returned.
    pub async fn from_raw_channel<T: RawHidChannel>(raw: T) -> Result<Self, ChannelError> {
        Self::from_raw_channel_with(raw, DEFAULT_POLL_INTERVAL).await
    }

    /// Like [`Self::from_raw_channel`], but with a custom poll interval.
    pub async fn from_raw_channel_with<T: RawHidChannel>(
        raw: T,
        poll_interval: Duration,
    ) -> Result<Self, ChannelError> {
        let (supports_short, supports_long) = supports_short_long_hidpp(&raw).await?;

        if !supports_short && !supports_long {
            return Err(ChannelError::HidppNotSupported);
        }

        let vendor_id = raw.vendor_id();
        let product_id = raw.product_id();
        let path = raw.path();

        let raw_channel: Arc<dyn RawHidChannel> = Arc::new(raw);
        let state = Arc::new(SessionState::new());
        let (close_sender, close_receiver) = oneshot::channel::<()>();

        tokio::spawn(read_loop(
            Arc::clone(&raw_channel),
            Arc::clone(&state),
            close_receiver,
            poll_interval,
        ));

        Ok(Self {
            supports_short,
            supports_long,
            vendor_id,
            product_id,
            path,
            raw_channel,
            state,
            next_sw_id: AtomicU8::new(rand::random_range(1..=0x0f)),
            timeout: Mutex::new(DEFAULT_REQUEST_TIMEOUT),
            read_task_close: Mutex::new(Some(close_sender)),
        })
    }

    /// Creates a new receiver for notifications and transport loss.
    pub fn listen(&self) -> flume::Receiver<SessionEvent> {
        self.state.events.create_receiver()
    }

    /// Returns a fresh software ID in `1..=15`.
    ///
    /// Zero is reserved for notifications, so requests never use it.
    pub fn get_sw_id(&self) -> U4 {
        let id = self
            .next_sw_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id >= 0x0f { 1 } else { id + 1 })
            })
            .unwrap_or(1);

        U4::from_lo(id)
    }

    /// The timeout used by [`crate::protocol`] and feature helpers.
    pub fn timeout(&self) -> Duration {
        *lock(&self.timeout)
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *lock(&self.timeout) = timeout;
    }

    /// Checks whether the channel supports the given HID++ message.
    pub fn supports_msg(&self, msg: &Frame) -> bool {
        match msg {
            Frame::Short(..) => self.supports_short,
            Frame::Long(..) | Frame::VeryLong(..) => self.supports_long,
        }
    }

    /// Whether the session was closed, either explicitly or by losing the
    /// transport.
    pub fn is_closed(&self) -> bool {
        self.state.closed().is_some()
    }

    /// The amount of exchanges currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.state.pending).len()
    }

    /// Sends a HID++2.0 request and waits for its response.
    ///
    /// The frame is short if the payload fits and the channel supports it,
    /// long otherwise.
    pub async fn send_request(
        &self,
        device_index: u8,
        feature_index: u8,
        function_id: U4,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Frame, ChannelError> {
        let kind = if payload.len() <= 3 && self.supports_short {
            ReportKind::Short
        } else {
            ReportKind::Long
        };

        let header = FrameHeader::v20(device_index, feature_index, function_id, U4::from_lo(0));
        self.send(Frame::new(kind, header, payload), timeout).await
    }

    /// Sends a HID++ frame and waits for the matching response.
    ///
    /// HID++2.0 requests get a fresh software ID assigned. If another request
    /// for the same exchange key is in flight, this waits for it to finish
    /// first; if that wait does not end within `timeout`,
    /// [`ChannelError::Busy`] is returned.
    pub async fn send(&self, msg: Frame, timeout: Duration) -> Result<Frame, ChannelError> {
        if !self.supports_msg(&msg) {
            return Err(ChannelError::MessageTypeNotSupported);
        }

        let msg = self.tag(msg);
        let header = msg.header();
        let key = ExchangeKey::from(header);
        let deadline = Instant::now() + timeout;

        let key_lock = self.state.key_lock(key);
        let _guard = tokio::time::timeout_at(deadline, key_lock.lock_owned())
            .await
            .map_err(|_| ChannelError::Busy)?;

        let (sender, receiver) = oneshot::channel();
        self.state.register(key, PendingExchange {
            expected: header,
            sender,
        })?;

        if let Err(err) = self.write(&msg).await {
            lock(&self.state.pending).remove(&key);
            return Err(err);
        }

        let result = match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(result)) => result,
            // The sender is only dropped when the session goes away.
            Ok(Err(_)) => Err(ExchangeFailure::Closed(CloseReason::Cancelled)),
            Err(_) => {
                let mut pending = lock(&self.state.pending);
                if pending.get(&key).is_some_and(|p| p.expected == header) {
                    pending.remove(&key);
                }
                debug!(?header, "request timed out");
                return Err(ChannelError::Timeout);
            },
        };

        match result {
            Ok(frame) => Ok(frame),
            Err(ExchangeFailure::Closed(reason)) => Err(reason.into()),
            Err(ExchangeFailure::Error(error)) => Err(ChannelError::from_error_frame(error)),
        }
    }

    /// Sends a HID++ message across the channel and does not wait for a
    /// response.
    pub async fn send_and_forget(&self, msg: Frame) -> Result<(), ChannelError> {
        if !self.supports_msg(&msg) {
            return Err(ChannelError::MessageTypeNotSupported);
        }
        if let Some(reason) = self.state.closed() {
            return Err(reason.into());
        }

        self.write(&self.tag(msg)).await
    }

    /// Fails every pending exchange with [`ChannelError::Cancelled`] while
    /// keeping the session open.
    pub fn cancel_pending(&self) {
        self.state.fail_pending(CloseReason::Cancelled);
    }

    /// Closes the session: the read task stops, pending exchanges fail with
    /// [`ChannelError::Cancelled`] and further requests are rejected.
    pub fn close(&self) {
        self.state.close(CloseReason::Cancelled);
        self.state.events.close();

        if let Some(read_task_close) = lock(&self.read_task_close).take() {
            // This only fails if the read task already stopped by itself.
            let _ = read_task_close.send(());
        }
    }

    /// Assigns a fresh software ID to HID++2.0 requests.
    fn tag(&self, msg: Frame) -> Frame {
        let mut header = msg.header();
        if v10::is_register_access(header.feature_index) {
            return msg;
        }

        header.function_and_sw_id = U4::combine(header.function_id(), self.get_sw_id());
        Frame::new(msg.kind(), header, msg.payload())
    }

    async fn write(&self, msg: &Frame) -> Result<(), ChannelError> {
        let mut buf = [0u8; MAX_REPORT_LENGTH];
        let len = msg.encode_into(&mut buf);

        match self.raw_channel.write_report(&buf[..len]).await {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(path = %self.path, "writing to the HID node failed: {err}");
                if self.state.close(CloseReason::TransportLost) {
                    self.state.events.emit(SessionEvent::TransportLost(err.to_string()));
                }
                Err(ChannelError::DeviceUnreachable)
            },
        }
    }
}

/// Continuously reads reports until the session is closed or the transport
/// fails.
async fn read_loop(
    raw_channel: Arc<dyn RawHidChannel>,
    state: Arc<SessionState>,
    mut close_receiver: oneshot::Receiver<()>,
    poll_interval: Duration,
) {
    let mut buf = [0u8; MAX_REPORT_LENGTH];

    loop {
        let res = select! {
            _ = close_receiver => break,
            res = raw_channel.read_report(&mut buf, poll_interval).fuse() => res,
        };

        match res {
            Ok(0) => continue,
            Ok(len) => state.dispatch(&buf[..len]),
            Err(err) => {
                warn!(path = %raw_channel.path(), "reading from the HID node failed: {err}");
                if state.close(CloseReason::TransportLost) {
                    state.events.emit(SessionEvent::TransportLost(err.to_string()));
                }
                break;
            },
        }
    }

    trace!(path = %raw_channel.path(), "read task stopped");
}

/// Represents an error returned by a HID++ device in response to a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("the device answered with HID++1.0 error {0:?}")]
    Hidpp10(v10::ErrorType),

    #[error("the device answered with HID++2.0 error {0:?}")]
    Hidpp20(v20::ErrorType),

    #[error("the device answered with unknown error code {0:#04x}")]
    UnknownCode(u8),

    #[error("the response could not be interpreted")]
    UnsupportedResponse,
}

/// Represents an error that occurred when creating or interacting with a HID or
/// HID++ communication channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Indicates that the raw channel failed while setting up the session.
    #[error("the HID transport failed")]
    Transport(#[from] TransportError),

    /// Indicates that the HID report descriptor could not be parsed.
    #[error("the report descriptor could not be parsed")]
    ReportDescriptor(hidreport::ParserError),

    /// Indicates that the channel in question does not support HID++.
    #[error("the HID channel does not support HID++")]
    HidppNotSupported,

    /// Indicates that the HID++ channel does not support messages of the given
    /// type (short/long).
    #[error("the channel does not support the given HID++ message type")]
    MessageTypeNotSupported,

    /// Indicates that no response arrived before the deadline.
    #[error("no response was received in time")]
    Timeout,

    /// Indicates that the transport is gone or the device is not reachable.
    #[error("the device is unreachable")]
    DeviceUnreachable,

    /// Indicates that another exchange for the same key is in flight.
    #[error("another request for the same function is still in flight")]
    Busy,

    /// Indicates that the session was closed while the request was pending.
    #[error("the request was cancelled")]
    Cancelled,

    /// Indicates that the device rejected the request or answered with
    /// something unexpected.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ChannelError {
    fn from_error_frame(error: ErrorFrame) -> Self {
        if error.hidpp20 {
            return match v20::ErrorType::try_from(error.code) {
                Ok(v20::ErrorType::Busy) => ChannelError::Busy,
                Ok(typ) => ProtocolError::Hidpp20(typ).into(),
                Err(_) => ProtocolError::UnknownCode(error.code).into(),
            };
        }

        match v10::ErrorType::try_from(error.code) {
            Ok(v10::ErrorType::UnknownDevice | v10::ErrorType::ResourceError) => {
                ChannelError::DeviceUnreachable
            },
            Ok(v10::ErrorType::Busy) => ChannelError::Busy,
            Ok(typ) => ProtocolError::Hidpp10(typ).into(),
            Err(_) => ProtocolError::UnknownCode(error.code).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LoopbackChannel, Responder};

    fn v20_reply(request: &Frame, payload: &[u8]) -> Vec<u8> {
        Frame::new(ReportKind::Long, request.header(), payload).encode()
    }

    #[tokio::test]
    async fn matches_responses_regardless_of_notifications() {
        let (raw, handle) = LoopbackChannel::new();
        handle.set_responder(Responder::new(|request: &Frame| {
            let header = request.header();
            // Interleave a battery broadcast with every answer.
            let event = Frame::new(
                ReportKind::Long,
                FrameHeader::v20(header.device_index, 0x04, U4::from_lo(0), U4::from_lo(0)),
                &[0x50],
            );
            vec![event.encode(), v20_reply(request, &[header.feature_index])]
        }));

        let chan = Arc::new(HidppChannel::from_raw_channel(raw).await.unwrap());
        let events = chan.listen();

        let mut tasks = Vec::new();
        for feature_index in 1..=5u8 {
            let chan = Arc::clone(&chan);
            tasks.push(tokio::spawn(async move {
                let resp = chan
                    .send_request(0x01, feature_index, U4::from_lo(1), &[], Duration::from_secs(1))
                    .await
                    .unwrap();
                assert_eq!(resp.payload()[0], feature_index);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let notifications = events.drain().count();
        assert_eq!(notifications, 5);
        assert_eq!(chan.pending_count(), 0);
    }

    #[test]
    fn exchanges_are_never_registered_on_a_closed_session() {
        let state = SessionState::new();
        let header = FrameHeader::v20(0x01, 0x02, U4::from_lo(1), U4::from_lo(3));
        let key = ExchangeKey::from(header);

        let (sender, mut registered) = oneshot::channel();
        state
            .register(key, PendingExchange {
                expected: header,
                sender,
            })
            .unwrap();
        assert!(state.close(CloseReason::Cancelled));
        assert!(matches!(
            registered.try_recv(),
            Ok(Some(Err(ExchangeFailure::Closed(CloseReason::Cancelled))))
        ));

        let (sender, _late) = oneshot::channel();
        let rejected = state.register(key, PendingExchange {
            expected: header,
            sender,
        });
        assert_eq!(rejected.err(), Some(CloseReason::Cancelled));
        assert!(lock(&state.pending).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_clears_the_pending_exchange() {
        let (raw, _handle) = LoopbackChannel::new();
        let chan = HidppChannel::from_raw_channel(raw).await.unwrap();

        let err = chan
            .send_request(0x01, 0x02, U4::from_lo(0), &[], Duration::from_millis(500))
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::Timeout));
        assert_eq!(chan.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_requests_never_overlap() {
        let (raw, handle) = LoopbackChannel::new();
        let chan = Arc::new(HidppChannel::from_raw_channel(raw).await.unwrap());

        let first = tokio::spawn({
            let chan = Arc::clone(&chan);
            async move {
                chan.send_request(0x01, 0x03, U4::from_lo(2), &[], Duration::from_secs(5))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The second request has to wait for the first one and gives up.
        let second = chan
            .send_request(0x01, 0x03, U4::from_lo(2), &[], Duration::from_millis(100))
            .await;
        assert!(matches!(second, Err(ChannelError::Busy)));
        assert_eq!(handle.written().len(), 1);

        let request = Frame::decode(&handle.written()[0]).unwrap();
        handle.inject(v20_reply(&request, &[0xaa]));
        assert_eq!(first.await.unwrap().unwrap().payload()[0], 0xaa);
    }

    #[tokio::test]
    async fn error_frames_map_to_error_kinds() {
        let (raw, handle) = LoopbackChannel::new();
        handle.set_responder(Responder::new(|request: &Frame| {
            let header = request.header();
            let code = match header.device_index {
                0x01 => 0x08, // HID++2.0 busy
                _ => 0x02,    // HID++2.0 invalid argument
            };
            vec![
                Frame::new(
                    ReportKind::Long,
                    FrameHeader {
                        device_index: header.device_index,
                        feature_index: 0xff,
                        function_and_sw_id: header.feature_index,
                    },
                    &[header.function_and_sw_id, code],
                )
                .encode(),
            ]
        }));

        let chan = HidppChannel::from_raw_channel(raw).await.unwrap();
        let timeout = Duration::from_secs(1);

        let busy = chan.send_request(0x01, 0x05, U4::from_lo(1), &[], timeout).await;
        assert!(matches!(busy, Err(ChannelError::Busy)));

        let invalid = chan.send_request(0x02, 0x05, U4::from_lo(1), &[], timeout).await;
        assert!(matches!(
            invalid,
            Err(ChannelError::Protocol(ProtocolError::Hidpp20(
                v20::ErrorType::InvalidArgument
            )))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_loss_fails_pending_requests() {
        let (raw, handle) = LoopbackChannel::new();
        let chan = Arc::new(HidppChannel::from_raw_channel(raw).await.unwrap());
        let events = chan.listen();

        let pending = tokio::spawn({
            let chan = Arc::clone(&chan);
            async move {
                chan.send_request(0x01, 0x03, U4::from_lo(0), &[], Duration::from_secs(5))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        handle.disconnect();

        assert!(matches!(pending.await.unwrap(), Err(ChannelError::DeviceUnreachable)));
        assert!(matches!(
            events.recv_async().await,
            Ok(SessionEvent::TransportLost(_))
        ));
        assert!(chan.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_requests() {
        let (raw, _handle) = LoopbackChannel::new();
        let chan = Arc::new(HidppChannel::from_raw_channel(raw).await.unwrap());

        let pending = tokio::spawn({
            let chan = Arc::clone(&chan);
            async move {
                chan.send_request(0x02, 0x01, U4::from_lo(0), &[], Duration::from_secs(5))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        chan.close();
        assert!(matches!(pending.await.unwrap(), Err(ChannelError::Cancelled)));

        let after = chan
            .send_request(0x02, 0x01, U4::from_lo(0), &[], Duration::from_secs(1))
            .await;
        assert!(matches!(after, Err(ChannelError::Cancelled)));
    }

    #[tokio::test]
    async fn sw_ids_rotate_and_skip_zero() {
        let (raw, _handle) = LoopbackChannel::new();
        let chan = HidppChannel::from_raw_channel(raw).await.unwrap();

        for _ in 0..40 {
            assert_ne!(chan.get_sw_id().to_lo(), 0);
        }
    }
}
