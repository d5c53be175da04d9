//! Fixed-size wire frame codec.
//!
//! Every datagram carries exactly one frame of `FRAME_LEN` bytes. The layout
//! (all integers big-endian):
//!
//! ```text
//! +------+-----+----------+----------+-----------+-----------+-----+
//! | kind | seq | data_len | name_len | name      | payload   | crc |
//! | (1B) |(4B) |   (4B)   |   (1B)   | (255B)    | (1024B)   |(4B) |
//! +------+-----+----------+----------+-----------+-----------+-----+
//! ```
//!
//! Unused regions are zero-filled so both peers observe identical bytes for
//! the same logical frame. The CRC-32 (reflected polynomial 0xEDB88320,
//! init and final XOR 0xFFFFFFFF) covers `payload[0..data_len)` of DATA
//! frames and is zero for every other kind.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RudderError};

/// Maximum payload bytes carried by one DATA frame.
pub const MAX_PAYLOAD: usize = 1024;

/// Maximum filename length on the wire.
pub const MAX_FILENAME: usize = 255;

/// Encoded size of every frame.
pub const FRAME_LEN: usize = 1 + 4 + 4 + 1 + MAX_FILENAME + MAX_PAYLOAD + 4;

/// Byte offset of the payload region inside an encoded frame.
pub const PAYLOAD_OFFSET: usize = 1 + 4 + 4 + 1 + MAX_FILENAME;

/// Frame kind discriminators as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    UploadRequest = 1,
    DownloadRequest = 2,
    Data = 3,
    Ack = 4,
    End = 5,
    Error = 6,
}

impl TryFrom<u8> for FrameKind {
    type Error = RudderError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::UploadRequest),
            2 => Ok(FrameKind::DownloadRequest),
            3 => Ok(FrameKind::Data),
            4 => Ok(FrameKind::Ack),
            5 => Ok(FrameKind::End),
            6 => Ok(FrameKind::Error),
            other => Err(RudderError::UnknownFrameKind(other)),
        }
    }
}

/// CRC-32 over `data`, as carried in DATA frames.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client asks to store `filename` on the responder.
    UploadRequest { filename: String },
    /// Client asks the responder to serve `filename`.
    DownloadRequest { filename: String },
    /// One windowed payload chunk.
    Data { seq: u32, payload: Bytes, checksum: u32 },
    /// Selective acknowledgement of exactly `seq`.
    Ack { seq: u32 },
    /// End of transfer; `seq` is the total frame count.
    End { seq: u32 },
    /// Terminal refusal carrying human-readable text.
    Error { message: String },
}

impl Frame {
    /// Build a DATA frame, precomputing its checksum.
    pub fn data(seq: u32, payload: Bytes) -> Self {
        let checksum = crc32(&payload);
        Frame::Data { seq, payload, checksum }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::UploadRequest { .. } => FrameKind::UploadRequest,
            Frame::DownloadRequest { .. } => FrameKind::DownloadRequest,
            Frame::Data { .. } => FrameKind::Data,
            Frame::Ack { .. } => FrameKind::Ack,
            Frame::End { .. } => FrameKind::End,
            Frame::Error { .. } => FrameKind::Error,
        }
    }

    /// The seq field as carried on the wire (zero for request and error
    /// kinds).
    pub fn seq(&self) -> u32 {
        match self {
            Frame::Data { seq, .. } | Frame::Ack { seq } | Frame::End { seq } => *seq,
            _ => 0,
        }
    }

    /// Recompute the CRC of a DATA frame and compare it with the stored
    /// field. Non-DATA frames always verify.
    pub fn verify_checksum(&self) -> bool {
        match self {
            Frame::Data { payload, checksum, .. } => crc32(payload) == *checksum,
            _ => true,
        }
    }

    /// Encode into a fresh `FRAME_LEN` buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_LEN);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into `buf`; always appends exactly `FRAME_LEN` bytes.
    ///
    /// Fields longer than their wire regions are truncated, keeping the
    /// codec total; constructors upstream enforce the real bounds.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let empty: &[u8] = &[];
        let (seq, name, payload, checksum) = match self {
            Frame::UploadRequest { filename } | Frame::DownloadRequest { filename } => {
                (0, filename.as_bytes(), empty, 0)
            }
            Frame::Data { seq, payload, checksum } => (*seq, empty, payload.as_ref(), *checksum),
            Frame::Ack { seq } => (*seq, empty, empty, 0),
            Frame::End { seq } => (*seq, empty, empty, 0),
            Frame::Error { message } => (0, empty, message.as_bytes(), 0),
        };
        let name = &name[..name.len().min(MAX_FILENAME)];
        let payload = &payload[..payload.len().min(MAX_PAYLOAD)];

        buf.put_u8(self.kind() as u8);
        buf.put_u32(seq);
        buf.put_u32(payload.len() as u32);
        buf.put_u8(name.len() as u8);
        buf.put_slice(name);
        buf.put_bytes(0, MAX_FILENAME - name.len());
        buf.put_slice(payload);
        buf.put_bytes(0, MAX_PAYLOAD - payload.len());
        buf.put_u32(checksum);
    }

    /// Decode one frame from `data`.
    ///
    /// Total: every failure is a structured error, never a panic. A
    /// datagram that is not exactly `FRAME_LEN` bytes is rejected.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_LEN {
            return Err(RudderError::FrameTooShort { expected: FRAME_LEN, actual: data.len() });
        }
        if data.len() > FRAME_LEN {
            return Err(RudderError::FrameTooLong(data.len()));
        }

        let kind = FrameKind::try_from(data[0])?;
        let seq = (&data[1..5]).get_u32();
        let data_len = (&data[5..9]).get_u32() as usize;
        if data_len > MAX_PAYLOAD {
            return Err(RudderError::PayloadTooLarge { len: data_len, max: MAX_PAYLOAD });
        }
        let name_len = data[9] as usize;
        let name = &data[10..10 + name_len];
        let payload = &data[PAYLOAD_OFFSET..PAYLOAD_OFFSET + data_len];
        let checksum = (&data[FRAME_LEN - 4..]).get_u32();

        match kind {
            FrameKind::UploadRequest => Ok(Frame::UploadRequest { filename: decode_name(name)? }),
            FrameKind::DownloadRequest => {
                Ok(Frame::DownloadRequest { filename: decode_name(name)? })
            }
            FrameKind::Data => Ok(Frame::Data {
                seq,
                payload: Bytes::copy_from_slice(payload),
                checksum,
            }),
            FrameKind::Ack => Ok(Frame::Ack { seq }),
            FrameKind::End => Ok(Frame::End { seq }),
            FrameKind::Error => Ok(Frame::Error {
                message: String::from_utf8_lossy(payload).into_owned(),
            }),
        }
    }
}

fn decode_name(raw: &[u8]) -> Result<String> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| RudderError::InvalidFilename(String::from_utf8_lossy(raw).into_owned()))
}
