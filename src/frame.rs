use std::io::{self, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::global::invalid_data_io_error;

/// The literal bytes a client sends as the very first thing on any new
/// connection, before any other command.
pub const MAGIC: &[u8] = b"  V2";

const HEARTBEAT_BODY: &[u8] = b"_heartbeat_";

const FRAME_TYPE_RESPONSE: u32 = 0;
const FRAME_TYPE_ERROR: u32 = 1;
const FRAME_TYPE_MESSAGE: u32 = 2;

/// A fully decoded inbound frame. `Heartbeat` is not a separate wire type;
/// it is a `Response` whose payload happens to equal `_heartbeat_`, recovered
/// by the `is_heartbeat` predicate rather than by a distinct variant, the
/// same way the wire protocol itself encodes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Vec<u8>),
    Error(Vec<u8>),
    Message(MessageFrame),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: [u8; 16],
    pub body: Vec<u8>,
}

pub fn is_heartbeat(frame: &Frame) -> bool {
    matches!(frame, Frame::Response(body) if body.as_slice() == HEARTBEAT_BODY)
}

pub fn is_response(frame: &Frame, text: &str) -> bool {
    matches!(frame, Frame::Response(body) if body.as_slice() == text.as_bytes())
}

pub fn is_ok(frame: &Frame) -> bool {
    is_response(frame, "OK")
}

pub fn is_message(frame: &Frame) -> bool {
    matches!(frame, Frame::Message(_))
}

pub fn is_error(frame: &Frame) -> bool {
    matches!(frame, Frame::Error(_))
}

pub fn encode_identify(params: &serde_json::Value) -> io::Result<Vec<u8>> {
    let body = serde_json::to_vec(params)
        .map_err(|e| invalid_data_io_error_owned(format!("invalid IDENTIFY params: {}", e)))?;
    let mut out = Vec::with_capacity(9 + 4 + body.len());
    out.extend_from_slice(b"IDENTIFY\n");
    out.write_u32::<BigEndian>(body.len() as u32)?;
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn encode_sub(topic: &str, channel: &str) -> Vec<u8> {
    format!("SUB {} {}\n", topic, channel).into_bytes()
}

pub fn encode_pub(topic: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(topic.len() + 6 + body.len());
    out.extend_from_slice(format!("PUB {}\n", topic).as_bytes());
    out.write_u32::<BigEndian>(body.len() as u32).expect("write to Vec never fails");
    out.extend_from_slice(body);
    out
}

pub fn encode_rdy(count: u32) -> Vec<u8> {
    format!("RDY {}\n", count).into_bytes()
}

pub fn encode_fin(message_id: &str) -> Vec<u8> {
    format!("FIN {}\n", message_id).into_bytes()
}

pub fn encode_req(message_id: &str, delay_ms: u64) -> Vec<u8> {
    format!("REQ {} {}\n", message_id, delay_ms).into_bytes()
}

pub fn encode_nop() -> Vec<u8> {
    b"NOP\n".to_vec()
}

pub fn encode_cls() -> Vec<u8> {
    b"CLS\n".to_vec()
}

/// Decodes a frame from exactly `S` bytes (the frame-type word followed by
/// its payload), i.e. the bytes that follow the 4-byte size prefix on the
/// wire.
pub fn decode_frame(bytes: &[u8]) -> io::Result<Frame> {
    if bytes.len() < 4 {
        return Err(invalid_data_io_error("frame shorter than its type word"));
    }

    let mut type_buf = &bytes[0..4];
    let frame_type = type_buf.read_u32::<BigEndian>()?;
    let payload = &bytes[4..];

    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Frame::Response(payload.to_vec())),
        FRAME_TYPE_ERROR => Ok(Frame::Error(payload.to_vec())),
        FRAME_TYPE_MESSAGE => decode_message(payload).map(Frame::Message),
        _ => Err(invalid_data_io_error("unknown frame type")),
    }
}

fn decode_message(payload: &[u8]) -> io::Result<MessageFrame> {
    if payload.len() < 26 {
        return Err(invalid_data_io_error("message frame shorter than its header"));
    }

    let mut ts_buf = &payload[0..8];
    let timestamp = ts_buf.read_i64::<BigEndian>()?;
    let mut attempts_buf = &payload[8..10];
    let attempts = attempts_buf.read_u16::<BigEndian>()?;
    let mut id = [0u8; 16];
    id.copy_from_slice(&payload[10..26]);
    let body = payload[26..].to_vec();

    Ok(MessageFrame {
        timestamp,
        attempts,
        id,
        body,
    })
}

fn frame_type_of(frame: &Frame) -> u32 {
    match frame {
        Frame::Response(_) => FRAME_TYPE_RESPONSE,
        Frame::Error(_) => FRAME_TYPE_ERROR,
        Frame::Message(_) => FRAME_TYPE_MESSAGE,
    }
}

/// Re-encodes a frame into the `S` bytes that `decode_frame` consumes
/// (type word + payload, no leading size prefix). Used by `encode_on_wire`
/// and directly by round-trip tests.
pub fn encode_frame_body(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u32::<BigEndian>(frame_type_of(frame)).expect("write to Vec never fails");

    match frame {
        Frame::Response(body) | Frame::Error(body) => out.extend_from_slice(body),
        Frame::Message(msg) => {
            out.write_i64::<BigEndian>(msg.timestamp).expect("write to Vec never fails");
            out.write_u16::<BigEndian>(msg.attempts).expect("write to Vec never fails");
            out.extend_from_slice(&msg.id);
            out.extend_from_slice(&msg.body);
        }
    }

    out
}

/// Re-encodes a frame exactly as it would appear on the wire, size prefix
/// included. `decode_frame(&encode_on_wire(f)[4..]) == f` for all `f`.
pub fn encode_on_wire(frame: &Frame) -> Vec<u8> {
    let body = encode_frame_body(frame);
    let mut out = Vec::with_capacity(4 + body.len());
    out.write_u32::<BigEndian>(body.len() as u32).expect("write to Vec never fails");
    out.extend_from_slice(&body);
    out
}

fn invalid_data_io_error_owned(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

enum ReadStep {
    Size,
    Body(usize),
}

/// An incremental NSQ frame reader.
///
/// Holds partially-read bytes across calls so that a non-blocking caller
/// can make progress one readiness event at a time without losing data: a
/// `WouldBlock` on the underlying source never discards what was already
/// read, it simply causes `read_from` to answer `Ok(None)` and remember
/// where it left off.
pub struct FrameReader {
    step: ReadStep,
    size_buf: [u8; 4],
    size_read: usize,
    body: Vec<u8>,
    body_read: usize,
}

impl FrameReader {
    pub fn new() -> FrameReader {
        FrameReader {
            step: ReadStep::Size,
            size_buf: [0u8; 4],
            size_read: 0,
            body: Vec::new(),
            body_read: 0,
        }
    }

    /// Advances by reading from `source`. Returns `Ok(Some(frame))` once a
    /// full frame has been decoded, `Ok(None)` if the source currently has
    /// no more bytes to offer (non-blocking: re-poll on the next readiness
    /// event), or an error on a malformed frame, a hard I/O failure, or EOF
    /// mid-frame.
    pub fn read_from<R: Read>(&mut self, source: &mut R) -> io::Result<Option<Frame>> {
        loop {
            match self.step {
                ReadStep::Size => {
                    let progressed = Self::fill(source, &mut self.size_buf, &mut self.size_read)?;
                    if self.size_read < self.size_buf.len() {
                        if !progressed {
                            return Ok(None);
                        }
                        continue;
                    }

                    let mut buf = &self.size_buf[..];
                    let size = buf.read_u32::<BigEndian>()? as usize;
                    self.body = vec![0u8; size];
                    self.body_read = 0;
                    self.step = ReadStep::Body(size);
                }
                ReadStep::Body(size) => {
                    let progressed = Self::fill(source, &mut self.body, &mut self.body_read)?;
                    if self.body_read < size {
                        if !progressed {
                            return Ok(None);
                        }
                        continue;
                    }

                    let frame = decode_frame(&self.body)?;
                    self.reset();
                    return Ok(Some(frame));
                }
            }
        }
    }

    fn reset(&mut self) {
        self.step = ReadStep::Size;
        self.size_read = 0;
        self.body.clear();
        self.body_read = 0;
    }

    /// Reads as much as is currently available into `buf[*read..]`.
    /// Returns `Ok(true)` if at least one byte was read, `Ok(false)` if the
    /// source would block (nothing to read right now), or an error —
    /// including a synthesized error for EOF mid-frame.
    fn fill<R: Read>(source: &mut R, buf: &mut [u8], read: &mut usize) -> io::Result<bool> {
        if *read >= buf.len() {
            return Ok(false);
        }

        match source.read(&mut buf[*read..]) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-frame")),
            Ok(n) => {
                *read += n;
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        FrameReader::new()
    }
}
