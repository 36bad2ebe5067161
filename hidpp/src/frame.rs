//! Encodes and decodes raw HID++ report frames.
//!
//! Every HID++ frame starts with a fixed four byte header followed by a
//! payload whose length is determined by the report ID:
//!
//! | report ID | class     | total length | payload |
//! |-----------|-----------|--------------|---------|
//! | `0x10`    | short     | 7            | 3       |
//! | `0x11`    | long      | 20           | 16      |
//! | `0x12`    | very long | 64           | 60      |
//!
//! The codec itself does not know about protocol versions. Byte 2 is the
//! feature index for HID++2.0 and the sub ID for HID++1.0, byte 3 is the
//! function/software ID pair for HID++2.0 and the register address for
//! HID++1.0. Helpers in [`crate::protocol`] give these bytes their meaning.

use thiserror::Error;

use crate::nibble::U4;

pub const SHORT_REPORT_ID: u8 = 0x10;
pub const SHORT_REPORT_LENGTH: usize = 7;

pub const LONG_REPORT_ID: u8 = 0x11;
pub const LONG_REPORT_LENGTH: usize = 20;

pub const VERY_LONG_REPORT_ID: u8 = 0x12;
pub const VERY_LONG_REPORT_LENGTH: usize = 64;

/// The length of the header every frame starts with, including the report ID.
pub const HEADER_LENGTH: usize = 4;

/// The size of a buffer able to hold any HID++ frame.
pub const MAX_REPORT_LENGTH: usize = VERY_LONG_REPORT_LENGTH;

/// The device index addressing the receiver itself.
pub const RECEIVER_DEVICE_INDEX: u8 = 0xff;

/// The sub ID of a HID++1.0 error message.
pub const HIDPP10_ERROR_SUB_ID: u8 = 0x8f;

/// The feature index of a HID++2.0 error message.
pub const HIDPP20_ERROR_FEATURE_INDEX: u8 = 0xff;

/// Represents the header that starts every HID++ frame (after the report ID).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FrameHeader {
    /// The index of the device involved in the communication.
    ///
    /// `0xff` addresses the receiver, `1..=6` the paired device slots.
    pub device_index: u8,

    /// The feature index (HID++2.0) or sub ID (HID++1.0).
    pub feature_index: u8,

    /// The function (leftmost 4 bits) and software (rightmost 4 bits) IDs for
    /// HID++2.0, the register address for HID++1.0.
    pub function_and_sw_id: u8,
}

impl FrameHeader {
    /// Builds a HID++2.0 header.
    pub fn v20(device_index: u8, feature_index: u8, function_id: U4, software_id: U4) -> Self {
        Self {
            device_index,
            feature_index,
            function_and_sw_id: U4::combine(function_id, software_id),
        }
    }

    /// The HID++2.0 function ID.
    pub fn function_id(&self) -> U4 {
        U4::from_hi(self.function_and_sw_id)
    }

    /// The HID++2.0 software ID, used as the request tag.
    pub fn software_id(&self) -> U4 {
        U4::from_lo(self.function_and_sw_id)
    }
}

/// The length class of a frame, selected by its report ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReportKind {
    Short,
    Long,
    VeryLong,
}

impl ReportKind {
    /// Maps a report ID to its length class.
    pub fn from_report_id(id: u8) -> Option<Self> {
        match id {
            SHORT_REPORT_ID => Some(Self::Short),
            LONG_REPORT_ID => Some(Self::Long),
            VERY_LONG_REPORT_ID => Some(Self::VeryLong),
            _ => None,
        }
    }

    pub fn report_id(self) -> u8 {
        match self {
            Self::Short => SHORT_REPORT_ID,
            Self::Long => LONG_REPORT_ID,
            Self::VeryLong => VERY_LONG_REPORT_ID,
        }
    }

    /// The total length of a frame of this class, including the report ID.
    pub fn length(self) -> usize {
        match self {
            Self::Short => SHORT_REPORT_LENGTH,
            Self::Long => LONG_REPORT_LENGTH,
            Self::VeryLong => VERY_LONG_REPORT_LENGTH,
        }
    }
}

/// Represents a HID++ frame consisting of a header and payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Frame {
    /// A short frame with 3 bytes of payload.
    Short(FrameHeader, [u8; SHORT_REPORT_LENGTH - HEADER_LENGTH]),

    /// A long frame with 16 bytes of payload.
    Long(FrameHeader, [u8; LONG_REPORT_LENGTH - HEADER_LENGTH]),

    /// A very long frame with 60 bytes of payload.
    VeryLong(FrameHeader, [u8; VERY_LONG_REPORT_LENGTH - HEADER_LENGTH]),
}

/// The class a decoded frame belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MessageClass {
    /// A response echoing the header of a previously sent request.
    Response,

    /// An unsolicited message originating from the hardware.
    Notification,

    /// An error response referencing the request that failed.
    Error(ErrorFrame),
}

/// The decoded contents of an error frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ErrorFrame {
    /// Whether the error uses the HID++2.0 (`0xff`) or HID++1.0 (`0x8f`)
    /// layout.
    pub hidpp20: bool,

    /// The header of the request this error answers.
    pub origin: FrameHeader,

    /// The raw error code.
    pub code: u8,
}

impl Frame {
    /// Builds a frame of the given class. Missing payload bytes are zeroed,
    /// surplus bytes are cut off.
    pub fn new(kind: ReportKind, header: FrameHeader, payload: &[u8]) -> Self {
        fn fill<const N: usize>(src: &[u8]) -> [u8; N] {
            let mut data = [0u8; N];
            let len = src.len().min(N);
            data[..len].copy_from_slice(&src[..len]);
            data
        }

        match kind {
            ReportKind::Short => Self::Short(header, fill(payload)),
            ReportKind::Long => Self::Long(header, fill(payload)),
            ReportKind::VeryLong => Self::VeryLong(header, fill(payload)),
        }
    }

    /// Decodes a frame from raw report data.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_LENGTH {
            return Err(FrameError::TooShort(data.len()));
        }

        let kind = ReportKind::from_report_id(data[0]).ok_or(FrameError::UnknownReportId(data[0]))?;
        if data.len() != kind.length() {
            return Err(FrameError::LengthMismatch {
                kind,
                expected: kind.length(),
                actual: data.len(),
            });
        }

        let header = FrameHeader {
            device_index: data[1],
            feature_index: data[2],
            function_and_sw_id: data[3],
        };

        Ok(Self::new(kind, header, &data[HEADER_LENGTH..]))
    }

    /// Writes the frame in its raw byte form into a buffer.
    ///
    /// Returns the amount of written bytes. The buffer must be able to hold
    /// [`Self::kind`]'s length.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        let kind = self.kind();
        let header = self.header();

        buf[0] = kind.report_id();
        buf[1] = header.device_index;
        buf[2] = header.feature_index;
        buf[3] = header.function_and_sw_id;
        buf[HEADER_LENGTH..kind.length()].copy_from_slice(self.payload());

        kind.length()
    }

    /// Encodes the frame into a freshly allocated buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.kind().length()];
        self.encode_into(&mut buf);
        buf
    }

    pub fn kind(&self) -> ReportKind {
        match self {
            Self::Short(..) => ReportKind::Short,
            Self::Long(..) => ReportKind::Long,
            Self::VeryLong(..) => ReportKind::VeryLong,
        }
    }

    /// Extracts the header of the frame.
    pub fn header(&self) -> FrameHeader {
        match *self {
            Self::Short(header, _) => header,
            Self::Long(header, _) => header,
            Self::VeryLong(header, _) => header,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Short(_, payload) => payload,
            Self::Long(_, payload) => payload,
            Self::VeryLong(_, payload) => payload,
        }
    }

    /// Extracts the payload of the frame and fits it into an array capable of
    /// containing the longest possible payload, filling the rest up with
    /// zeroes.
    pub fn extend_payload(&self) -> [u8; VERY_LONG_REPORT_LENGTH - HEADER_LENGTH] {
        let mut data = [0u8; VERY_LONG_REPORT_LENGTH - HEADER_LENGTH];
        let payload = self.payload();
        data[..payload.len()].copy_from_slice(payload);
        data
    }

    /// Determines the class of the frame.
    ///
    /// HID++1.0 receiver notifications use sub IDs `0x40..=0x5f` and are
    /// recognized by those alone, as they carry arbitrary data in byte 3.
    /// HID++2.0 events always carry a software ID of zero. Everything else is
    /// treated as a response.
    pub fn class(&self) -> MessageClass {
        let header = self.header();
        let payload = self.payload();

        match header.feature_index {
            HIDPP10_ERROR_SUB_ID if self.kind() == ReportKind::Short => {
                MessageClass::Error(ErrorFrame {
                    hidpp20: false,
                    origin: FrameHeader {
                        device_index: header.device_index,
                        feature_index: header.function_and_sw_id,
                        function_and_sw_id: payload[0],
                    },
                    code: payload[1],
                })
            },
            HIDPP20_ERROR_FEATURE_INDEX => MessageClass::Error(ErrorFrame {
                hidpp20: true,
                origin: FrameHeader {
                    device_index: header.device_index,
                    feature_index: header.function_and_sw_id,
                    function_and_sw_id: payload[0],
                },
                code: payload[1],
            }),
            0x40..=0x5f => MessageClass::Notification,
            0x80..=0x83 => MessageClass::Response,
            _ if header.software_id().to_lo() == 0 => MessageClass::Notification,
            _ => MessageClass::Response,
        }
    }

    /// Whether the frame was sent by the receiver itself rather than a paired
    /// device.
    pub fn is_receiver_level(&self) -> bool {
        self.header().device_index == RECEIVER_DEVICE_INDEX
    }
}

/// Represents an error that occurred while decoding a raw frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Indicates that the buffer cannot even hold the frame header.
    #[error("a frame of {0} bytes is shorter than the header")]
    TooShort(usize),

    /// Indicates that the first byte is not a known HID++ report ID.
    #[error("{0:#04x} is not a HID++ report ID")]
    UnknownReportId(u8),

    /// Indicates that the buffer length does not match its report ID.
    #[error("a {kind:?} frame must be {expected} bytes long, got {actual}")]
    LengthMismatch {
        kind: ReportKind,
        expected: usize,
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: ReportKind, bytes: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; kind.length()];
        data[0] = kind.report_id();
        data[1..1 + bytes.len()].copy_from_slice(bytes);
        data
    }

    #[test]
    fn decode_then_encode_is_identity_for_every_class() {
        let short = raw(ReportKind::Short, &[0x01, 0x05, 0x1a, 0xaa, 0xbb, 0xcc]);
        let long = raw(ReportKind::Long, &[0xff, 0x83, 0xb5, 0x51, 0x00, 0x8f]);
        let mut very_long = raw(ReportKind::VeryLong, &[0x02, 0x0c, 0x2d]);
        very_long[63] = 0x7e;

        for data in [short, long, very_long] {
            let frame = Frame::decode(&data).unwrap();
            assert_eq!(frame.encode(), data);
        }
    }

    #[test]
    fn decode_rejects_truncated_buffers() {
        assert_eq!(Frame::decode(&[]), Err(FrameError::TooShort(0)));
        assert_eq!(Frame::decode(&[0x10, 0xff, 0x81]), Err(FrameError::TooShort(3)));
        assert!(matches!(
            Frame::decode(&[0x11, 0xff, 0x81, 0x02, 0x00]),
            Err(FrameError::LengthMismatch {
                kind: ReportKind::Long,
                ..
            })
        ));
    }

    #[test]
    fn decode_rejects_unknown_report_ids() {
        assert_eq!(
            Frame::decode(&[0x20, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]),
            Err(FrameError::UnknownReportId(0x20))
        );
    }

    #[test]
    fn header_splits_function_and_software_id() {
        let header = FrameHeader::v20(0x02, 0x07, U4::from_lo(0x3), U4::from_lo(0xa));
        assert_eq!(header.function_and_sw_id, 0x3a);
        assert_eq!(header.function_id(), U4::from_lo(0x3));
        assert_eq!(header.software_id(), U4::from_lo(0xa));
    }

    #[test]
    fn classifies_hidpp20_error() {
        let frame = Frame::decode(&raw(ReportKind::Long, &[0x01, 0xff, 0x05, 0x1b, 0x02])).unwrap();
        let MessageClass::Error(err) = frame.class() else {
            panic!("expected an error frame");
        };

        assert!(err.hidpp20);
        assert_eq!(err.origin, FrameHeader {
            device_index: 0x01,
            feature_index: 0x05,
            function_and_sw_id: 0x1b,
        });
        assert_eq!(err.code, 0x02);
    }

    #[test]
    fn classifies_hidpp10_error() {
        let frame = Frame::decode(&raw(ReportKind::Short, &[0xff, 0x8f, 0x81, 0xb5, 0x03])).unwrap();
        let MessageClass::Error(err) = frame.class() else {
            panic!("expected an error frame");
        };

        assert!(!err.hidpp20);
        assert_eq!(err.origin.feature_index, 0x81);
        assert_eq!(err.origin.function_and_sw_id, 0xb5);
        assert_eq!(err.code, 0x03);
    }

    #[test]
    fn classifies_notifications_and_responses() {
        // Bolt device connection, byte 3 carries protocol data.
        let connection = Frame::decode(&raw(ReportKind::Short, &[0x02, 0x41, 0x10, 0x02])).unwrap();
        assert_eq!(connection.class(), MessageClass::Notification);
        assert!(!connection.is_receiver_level());

        // Battery broadcast from feature index 4.
        let event = Frame::decode(&raw(ReportKind::Long, &[0x01, 0x04, 0x00, 0x50])).unwrap();
        assert_eq!(event.class(), MessageClass::Notification);

        let response = Frame::decode(&raw(ReportKind::Long, &[0x01, 0x04, 0x13, 0x50])).unwrap();
        assert_eq!(response.class(), MessageClass::Response);

        let register = Frame::decode(&raw(ReportKind::Short, &[0xff, 0x81, 0x00])).unwrap();
        assert_eq!(register.class(), MessageClass::Response);
        assert!(register.is_receiver_level());
    }

    #[test]
    fn new_pads_and_truncates_payload() {
        let header = FrameHeader::v20(0x01, 0x00, U4::from_lo(1), U4::from_lo(1));
        let frame = Frame::new(ReportKind::Short, header, &[0x01]);
        assert_eq!(frame.payload(), &[0x01, 0x00, 0x00]);

        let frame = Frame::new(ReportKind::Short, header, &[1, 2, 3, 4, 5]);
        assert_eq!(frame.payload(), &[1, 2, 3]);
    }
}
