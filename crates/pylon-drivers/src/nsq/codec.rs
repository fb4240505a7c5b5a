//! nsqd TCP protocol framing.
//!
//! After the `"  V2"` magic the client sends newline-terminated commands,
//! some followed by a size-prefixed body. Every server frame is
//! `[size: u32 BE][type: u32 BE][data]` where size covers type and data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pylon_core::DriverError;
use tokio_util::codec::{Decoder, Encoder};

pub const MAGIC_V2: &[u8] = b"  V2";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

const MAX_FRAME: usize = 64 * 1024 * 1024;
const MESSAGE_HEADER: usize = 8 + 2 + 16;

const FRAME_RESPONSE: u32 = 0;
const FRAME_ERROR: u32 = 1;
const FRAME_MESSAGE: u32 = 2;

/// 16 printable bytes assigned by nsqd.
pub type MessageId = [u8; 16];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

impl Message {
    pub fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(Message),
}

impl Frame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(data) if data.as_ref() == HEARTBEAT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Client metadata as a JSON object.
    Identify(Bytes),
    Pub { topic: String, body: Bytes },
    Mpub { topic: String, bodies: Vec<Bytes> },
    Dpub { topic: String, defer_ms: u64, body: Bytes },
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Req { id: MessageId, timeout_ms: u64 },
    Touch(MessageId),
    Nop,
    Cls,
}

fn put_body(dst: &mut BytesMut, body: &[u8]) {
    dst.put_u32(body.len() as u32);
    dst.put_slice(body);
}

fn put_line(dst: &mut BytesMut, parts: &[&[u8]]) {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            dst.put_u8(b' ');
        }
        dst.put_slice(part);
    }
    dst.put_u8(b'\n');
}

/// Topic and channel names: 1-64 of `[.a-zA-Z0-9_-]`, `#ephemeral` suffix allowed.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'#'))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NsqCodec;

impl Decoder for NsqCodec {
    type Item = Frame;
    type Error = DriverError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DriverError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if !(4..=MAX_FRAME).contains(&size) {
            return Err(DriverError::Protocol(format!("invalid frame size {size}")));
        }
        if src.len() < 4 + size {
            src.reserve(4 + size - src.len());
            return Ok(None);
        }
        src.advance(4);
        let frame_type = src.get_u32();
        let mut data = src.split_to(size - 4).freeze();
        match frame_type {
            FRAME_RESPONSE => Ok(Some(Frame::Response(data))),
            FRAME_ERROR => Ok(Some(Frame::Error(data))),
            FRAME_MESSAGE => {
                if data.len() < MESSAGE_HEADER {
                    return Err(DriverError::Protocol(format!(
                        "message frame too short ({} bytes)",
                        data.len()
                    )));
                }
                let timestamp = data.get_i64();
                let attempts = data.get_u16();
                let mut id = [0u8; 16];
                data.copy_to_slice(&mut id);
                Ok(Some(Frame::Message(Message {
                    timestamp,
                    attempts,
                    id,
                    body: data,
                })))
            }
            other => Err(DriverError::Protocol(format!("unknown frame type {other}"))),
        }
    }
}

impl Encoder<Command> for NsqCodec {
    type Error = DriverError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), DriverError> {
        match command {
            Command::Identify(body) => {
                put_line(dst, &[b"IDENTIFY"]);
                put_body(dst, &body);
            }
            Command::Pub { topic, body } => {
                put_line(dst, &[b"PUB", topic.as_bytes()]);
                put_body(dst, &body);
            }
            Command::Mpub { topic, bodies } => {
                put_line(dst, &[b"MPUB", topic.as_bytes()]);
                let size = 4 + bodies.iter().map(|b| 4 + b.len()).sum::<usize>();
                dst.put_u32(size as u32);
                dst.put_u32(bodies.len() as u32);
                for body in &bodies {
                    put_body(dst, body);
                }
            }
            Command::Dpub { topic, defer_ms, body } => {
                put_line(dst, &[b"DPUB", topic.as_bytes(), defer_ms.to_string().as_bytes()]);
                put_body(dst, &body);
            }
            Command::Sub { topic, channel } => {
                put_line(dst, &[b"SUB", topic.as_bytes(), channel.as_bytes()]);
            }
            Command::Rdy(count) => put_line(dst, &[b"RDY", count.to_string().as_bytes()]),
            Command::Fin(id) => put_line(dst, &[b"FIN", &id]),
            Command::Req { id, timeout_ms } => {
                put_line(dst, &[b"REQ", &id, timeout_ms.to_string().as_bytes()]);
            }
            Command::Touch(id) => put_line(dst, &[b"TOUCH", &id]),
            Command::Nop => put_line(dst, &[b"NOP"]),
            Command::Cls => put_line(dst, &[b"CLS"]),
        }
        Ok(())
    }
}
