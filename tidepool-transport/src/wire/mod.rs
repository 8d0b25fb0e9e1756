//! Wire format for RPC frames.
//!
//! Frame format: `[length:4][checksum:4][kind:1][method:4][correlation:8][payload:N]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of everything after the checksum field
//! - **kind**: [`FrameKind`] discriminant
//! - **method**: Service method the frame is addressed to
//! - **correlation**: Request id echoed by the matching response, 0 for one-way frames
//! - **payload**: Codec-encoded body

/// Header size: 4 (length) + 4 (checksum) + 1 (kind) + 4 (method) + 8 (correlation).
pub const HEADER_SIZE: usize = 21;

/// Maximum payload size (4MB).
///
/// Batched dispatch envelopes can get large, but anything above this is
/// treated as a corrupt or hostile stream.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header.
        expected: u32,
        /// Checksum computed from the data.
        actual: u32,
    },

    /// Payload exceeds maximum allowed size.
    #[error("frame too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    FrameTooLarge {
        /// Payload size in bytes.
        size: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// Unknown frame kind byte.
    #[error("unknown frame kind: {kind}")]
    UnknownKind {
        /// The raw kind byte.
        kind: u8,
    },
}

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A call expecting a response with the same correlation id.
    Request = 1,
    /// Successful reply to a request.
    Response = 2,
    /// Failed reply to a request; payload is an encoded `ReplyError`.
    ErrorResponse = 3,
    /// Fire-and-forget message.
    OneWay = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(kind: u8) -> Result<Self, Self::Error> {
        match kind {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Response),
            3 => Ok(FrameKind::ErrorResponse),
            4 => Ok(FrameKind::OneWay),
            other => Err(WireError::UnknownKind { kind: other }),
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Target method.
    pub method: u32,
    /// Correlation id.
    pub correlation: u64,
    /// Frame body.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a one-way frame.
    pub fn one_way(method: u32, payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::OneWay,
            method,
            correlation: 0,
            payload,
        }
    }

    /// Build a request frame.
    pub fn request(method: u32, correlation: u64, payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Request,
            method,
            correlation,
            payload,
        }
    }
}

fn compute_checksum(kind: u8, method: u32, correlation: u64, payload: &[u8]) -> u32 {
    let mut head = [0u8; 13];
    head[0] = kind;
    head[1..5].copy_from_slice(&method.to_le_bytes());
    head[5..13].copy_from_slice(&correlation.to_le_bytes());
    crc32c::crc32c_append(crc32c::crc32c(&head), payload)
}

/// Serialize a frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the payload exceeds [`MAX_PAYLOAD_SIZE`].
///
/// # Examples
///
/// ```
/// use tidepool_transport::wire::{Frame, serialize_frame, try_deserialize_frame};
///
/// let frame = Frame::request(7, 42, b"hello".to_vec());
/// let bytes = serialize_frame(&frame).expect("serialize");
/// let (decoded, consumed) = try_deserialize_frame(&bytes)
///     .expect("valid")
///     .expect("complete");
/// assert_eq!(decoded, frame);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn serialize_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            size: frame.payload.len(),
        });
    }

    let total_length = HEADER_SIZE + frame.payload.len();
    let kind = frame.kind as u8;
    let checksum = compute_checksum(kind, frame.method, frame.correlation, &frame.payload);

    let mut data = Vec::with_capacity(total_length);
    data.extend_from_slice(&(total_length as u32).to_le_bytes());
    data.extend_from_slice(&checksum.to_le_bytes());
    data.push(kind);
    data.extend_from_slice(&frame.method.to_le_bytes());
    data.extend_from_slice(&frame.correlation.to_le_bytes());
    data.extend_from_slice(&frame.payload);
    Ok(data)
}

/// Try to deserialize one frame from a buffer that may hold partial data.
///
/// # Returns
///
/// - `Ok(Some((frame, consumed)))` if a complete frame was parsed
/// - `Ok(None)` if more data is needed
/// - `Err` if the data is malformed
pub fn try_deserialize_frame(data: &[u8]) -> Result<Option<(Frame, usize)>, WireError> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if (length as usize) < HEADER_SIZE || length as usize > HEADER_SIZE + MAX_PAYLOAD_SIZE {
        return Err(WireError::InvalidLength { length });
    }
    let expected_len = length as usize;
    if data.len() < expected_len {
        return Ok(None);
    }

    let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let kind_byte = data[8];
    let method = u32::from_le_bytes([data[9], data[10], data[11], data[12]]);
    let mut correlation = [0u8; 8];
    correlation.copy_from_slice(&data[13..21]);
    let correlation = u64::from_le_bytes(correlation);
    let payload = &data[HEADER_SIZE..expected_len];

    let computed = compute_checksum(kind_byte, method, correlation, payload);
    if computed != checksum {
        return Err(WireError::ChecksumMismatch {
            expected: checksum,
            actual: computed,
        });
    }

    let frame = Frame {
        kind: FrameKind::try_from(kind_byte)?,
        method,
        correlation,
        payload: payload.to_vec(),
    };
    Ok(Some((frame, expected_len)))
}

/// Deserialize exactly one complete frame.
///
/// # Errors
///
/// `InsufficientData` when the buffer holds less than one frame, otherwise
/// the same errors as [`try_deserialize_frame`].
pub fn deserialize_frame(data: &[u8]) -> Result<Frame, WireError> {
    match try_deserialize_frame(data)? {
        Some((frame, _)) => Ok(frame),
        None => {
            let needed = if data.len() < HEADER_SIZE {
                HEADER_SIZE
            } else {
                u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize
            };
            Err(WireError::InsufficientData {
                needed,
                have: data.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_covers_payload() {
        let bytes = serialize_frame(&Frame::one_way(3, b"payload".to_vec())).expect("serialize");
        let mut corrupted = bytes.clone();
        corrupted[HEADER_SIZE + 1] ^= 0xFF;
        assert!(matches!(
            deserialize_frame(&corrupted),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_covers_method() {
        let bytes = serialize_frame(&Frame::one_way(3, b"payload".to_vec())).expect("serialize");
        let mut corrupted = bytes.clone();
        corrupted[9] ^= 0x01;
        assert!(matches!(
            deserialize_frame(&corrupted),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_partial_frames_need_more_data() {
        let bytes = serialize_frame(&Frame::request(1, 9, b"abcdef".to_vec())).expect("serialize");
        assert!(matches!(try_deserialize_frame(&bytes[..10]), Ok(None)));
        assert!(matches!(
            try_deserialize_frame(&bytes[..HEADER_SIZE + 2]),
            Ok(None)
        ));
        assert!(matches!(
            deserialize_frame(&bytes[..HEADER_SIZE + 2]),
            Err(WireError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = serialize_frame(&Frame::one_way(1, b"first".to_vec())).expect("first");
        buf.extend(serialize_frame(&Frame::one_way(2, b"second".to_vec())).expect("second"));

        let (first, consumed) = try_deserialize_frame(&buf)
            .expect("valid")
            .expect("complete");
        assert_eq!(first.payload, b"first");
        let (second, _) = try_deserialize_frame(&buf[consumed..])
            .expect("valid")
            .expect("complete");
        assert_eq!(second.method, 2);
        assert_eq!(second.payload, b"second");
    }

    #[test]
    fn test_invalid_length_rejected() {
        let mut bytes = serialize_frame(&Frame::one_way(1, Vec::new())).expect("serialize");
        bytes[0..4].copy_from_slice(&5u32.to_le_bytes());
        assert!(matches!(
            try_deserialize_frame(&bytes),
            Err(WireError::InvalidLength { length: 5 })
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = Frame::one_way(1, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            serialize_frame(&frame),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let frame = Frame::one_way(1, Vec::new());
        let mut bytes = serialize_frame(&frame).expect("serialize");
        bytes[8] = 99;
        let checksum = compute_checksum(99, 1, 0, &[]);
        bytes[4..8].copy_from_slice(&checksum.to_le_bytes());
        assert_eq!(
            deserialize_frame(&bytes),
            Err(WireError::UnknownKind { kind: 99 })
        );
    }
}
