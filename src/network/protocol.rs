use crate::{RelayError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const TAG_CHAT: u8 = 0;
pub const TAG_FILE_BEGIN: u8 = 1;
pub const TAG_FILE_CHUNK: u8 = 2;
pub const TAG_FILE_END: u8 = 3;

// Type tag (1 byte) + payload length (u32, big-endian).
const HEADER_LEN: usize = 5;

pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// One self-delimited unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Chat(String),
    FileBegin { name: String, size: u64 },
    FileChunk(Bytes),
    FileEnd { checksum: Vec<u8> },
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Chat(_) => TAG_CHAT,
            Frame::FileBegin { .. } => TAG_FILE_BEGIN,
            Frame::FileChunk(_) => TAG_FILE_CHUNK,
            Frame::FileEnd { .. } => TAG_FILE_END,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Chat(text) => text.len(),
            Frame::FileBegin { name, .. } => 2 + name.len() + 8,
            Frame::FileChunk(data) => data.len(),
            Frame::FileEnd { checksum } => 1 + checksum.len(),
        }
    }
}

/// Length-prefixed frame codec. Inbound bytes accumulate in the read
/// buffer until a complete header plus payload is available; a single
/// read may therefore yield zero, one, or many frames.
#[derive(Debug)]
pub struct RelayCodec {
    max_frame_len: usize,
}

impl RelayCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for RelayCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for RelayCodec {
    type Item = Frame;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[1..HEADER_LEN]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;

        // Reject before buffering; a corrupt or hostile length must not
        // make us allocate.
        if payload_len > self.max_frame_len {
            return Err(RelayError::Framing(format!(
                "declared frame length {} exceeds limit {}",
                payload_len, self.max_frame_len
            )));
        }

        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }

        let tag = src[0];
        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len).freeze();

        decode_payload(tag, payload).map(Some)
    }
}

impl Encoder<Frame> for RelayCodec {
    type Error = RelayError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        // Validate before touching dst; a failed encode must not leave a
        // partial header behind.
        let payload_len = frame.payload_len();
        if payload_len > self.max_frame_len {
            return Err(RelayError::Framing(format!(
                "outgoing frame length {} exceeds limit {}",
                payload_len, self.max_frame_len
            )));
        }
        if let Frame::FileBegin { name, .. } = &frame {
            if name.len() > u16::MAX as usize {
                return Err(RelayError::Framing(format!(
                    "file name of {} bytes does not fit the wire format",
                    name.len()
                )));
            }
        }
        if let Frame::FileEnd { checksum } = &frame {
            if checksum.len() > u8::MAX as usize {
                return Err(RelayError::Framing(format!(
                    "checksum of {} bytes does not fit the wire format",
                    checksum.len()
                )));
            }
        }

        dst.reserve(HEADER_LEN + payload_len);
        dst.put_u8(frame.tag());
        dst.put_u32(payload_len as u32);

        match frame {
            Frame::Chat(text) => {
                dst.put_slice(text.as_bytes());
            }
            Frame::FileBegin { name, size } => {
                dst.put_u16(name.len() as u16);
                dst.put_slice(name.as_bytes());
                dst.put_u64(size);
            }
            Frame::FileChunk(data) => {
                dst.put_slice(&data);
            }
            Frame::FileEnd { checksum } => {
                dst.put_u8(checksum.len() as u8);
                dst.put_slice(&checksum);
            }
        }

        Ok(())
    }
}

fn decode_payload(tag: u8, payload: Bytes) -> Result<Frame> {
    match tag {
        TAG_CHAT => {
            let text = String::from_utf8(payload.to_vec())
                .map_err(|_| RelayError::Framing("chat payload is not valid UTF-8".to_string()))?;
            Ok(Frame::Chat(text))
        }
        TAG_FILE_BEGIN => {
            if payload.len() < 2 + 8 {
                return Err(RelayError::Framing(
                    "file-begin payload shorter than its fixed fields".to_string(),
                ));
            }
            let name_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
            if payload.len() != 2 + name_len + 8 {
                return Err(RelayError::Framing(
                    "file-begin payload does not match its declared name length".to_string(),
                ));
            }
            let name = std::str::from_utf8(&payload[2..2 + name_len])
                .map_err(|_| RelayError::Framing("file name is not valid UTF-8".to_string()))?
                .to_string();
            let mut size_bytes = [0u8; 8];
            size_bytes.copy_from_slice(&payload[2 + name_len..]);
            Ok(Frame::FileBegin {
                name,
                size: u64::from_be_bytes(size_bytes),
            })
        }
        TAG_FILE_CHUNK => Ok(Frame::FileChunk(payload)),
        TAG_FILE_END => {
            if payload.is_empty() {
                return Err(RelayError::Framing("empty file-end payload".to_string()));
            }
            let checksum_len = payload[0] as usize;
            if payload.len() != 1 + checksum_len {
                return Err(RelayError::Framing(
                    "file-end payload does not match its declared checksum length".to_string(),
                ));
            }
            Ok(Frame::FileEnd {
                checksum: payload[1..].to_vec(),
            })
        }
        other => Err(RelayError::Framing(format!("unknown frame type {}", other))),
    }
}
