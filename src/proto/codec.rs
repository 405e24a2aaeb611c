use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use std::{
    fmt::{self, Write},
    io::{self, Cursor},
};
use tokio_util::codec::{Decoder, Encoder};

use super::command::{Command, Reply};
use super::response::{Pulse, Response};
use super::MAX_LINE_LENGTH;

/// First byte of every frame in the acquisition stream.
pub const SYNC: u8 = 0xFF;
pub const FRAME_LEN: usize = 3;

const COUNTS_LEN: usize = 4;

/// Codec for the URSA-II serial protocol.
///
/// The inbound stream has no self-describing framing, so the decoder
/// follows the commands passing through the encoder: after `G` it
/// decodes histogram frames, after a request it decodes the matching
/// reply.
#[derive(Debug, Default)]
pub struct ProtocolCodec {
    last_cmd: Option<Command>,
    acquiring: bool,
    geiger: bool,
}

impl ProtocolCodec {
    /// True while the instrument streams histogram frames.
    pub fn is_streaming(&self) -> bool {
        self.acquiring && !self.geiger
    }

    /// Reply the decoder is currently waiting for.
    pub fn pending_reply(&self) -> Reply {
        self.last_cmd
            .as_ref()
            .map(Command::reply)
            .unwrap_or(Reply::None)
    }

    /// Force the mode, used when a command could not be written.
    pub(crate) fn set_mode(&mut self, acquiring: bool, geiger: bool) {
        self.acquiring = acquiring;
        self.geiger = geiger;
    }

    /// Stop waiting for a reply.
    pub(crate) fn reset_reply(&mut self) {
        self.last_cmd = None;
    }

    // Decoding drains the buffer to less than a frame, so it stays bounded.
    fn decode_frame(src: &mut BytesMut) -> Option<Response> {
        if src.len() < FRAME_LEN {
            return None;
        }
        if src[0] != SYNC {
            let skip = src.iter().position(|b| *b == SYNC).unwrap_or(src.len());
            return Some(Response::Desync(src.split_to(skip).freeze()));
        }
        src.advance(1);
        let b0 = src.get_u8();
        let b1 = src.get_u8();

        let count = b0 >> 2;
        let energy = (u16::from(b0 & 0x03) << 8) | u16::from(b1);
        if count == 0 {
            Some(Response::Battery(energy))
        } else {
            Some(Response::Pulse(Pulse {
                count,
                channel: energy,
            }))
        }
    }

    fn decode_line(src: &mut BytesMut) -> Option<String> {
        let len = match src.iter().position(|b| *b == b'\n') {
            Some(n) => n + 1,
            None if src.len() >= MAX_LINE_LENGTH => MAX_LINE_LENGTH,
            None => return None,
        };
        let line = src.split_to(len);
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }

    fn decode_battery(&self, src: &mut BytesMut) -> Option<u16> {
        // Geiger mode prefixes the reading with one extra byte.
        let width = if self.geiger { 3 } else { 2 };
        if src.len() < width {
            return None;
        }
        let reply = src.split_to(width);
        let (b0, b1) = (reply[width - 2], reply[width - 1]);
        Some((u16::from(b0 & 0x03) << 8) | u16::from(b1))
    }
}

impl Decoder for ProtocolCodec {
    type Item = Response;
    // Framing problems are reported as items, only I/O fails the stream.
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.is_streaming() {
            return Ok(Self::decode_frame(src));
        }

        let reply = self.pending_reply();
        let item = match reply {
            Reply::Line => Self::decode_line(src).map(Response::Line),
            Reply::Counts => {
                if src.len() >= COUNTS_LEN {
                    let mut cur = Cursor::new(src.split_to(COUNTS_LEN));
                    Some(Response::Counts(cur.read_u32::<BigEndian>()?))
                } else {
                    None
                }
            }
            Reply::Battery => self.decode_battery(src).map(Response::Battery),
            Reply::None => {
                if src.is_empty() {
                    None
                } else {
                    Some(Response::Unsolicited(src.split().freeze()))
                }
            }
        };
        if item.is_some() {
            self.last_cmd = None;
        }
        Ok(item)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Keep partial frames, a serial line has no real end of stream.
        self.decode(buf)
    }
}

fn write_fmt_guarded(dst: &mut BytesMut, args: fmt::Arguments<'_>) -> Result<(), io::Error> {
    dst.write_fmt(args)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

impl Encoder<Command> for ProtocolCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &item {
            Command::Probe => dst.put_u8(b'U'),
            Command::StartAcquire => dst.put_u8(b'G'),
            Command::StopAcquire => dst.put_u8(b'R'),
            Command::EnterGeiger => dst.put_u8(b'J'),
            Command::LeaveGeiger => dst.put_u8(b'j'),
            Command::RequestCounts => dst.put_u8(b'c'),
            Command::StopVoltage => dst.put_u8(b'v'),
            Command::SetVoltage(value) => {
                dst.put_u8(b'V');
                dst.put_u16(*value);
            }
            Command::SetNoSave => dst.put_u8(b'd'),
            Command::LoadPrevious => dst.put_u8(b'r'),
            Command::SetRamp(value) => {
                dst.put_u8(b'P');
                dst.put_u16(*value);
            }
            Command::NoRamp => dst.put_u8(b'p'),
            Command::SetGain { coarse, fine } => {
                dst.put_u8(b'C');
                dst.put_u8(*coarse);
                dst.put_u8(b'F');
                dst.put_u8(*fine);
            }
            Command::SetInput(input) => write_fmt_guarded(dst, format_args!("I{}", *input as u8))?,
            Command::SetShapingTime(time) => {
                write_fmt_guarded(dst, format_args!("S{}", *time as u8))?
            }
            Command::SetThreshold(bytes) => {
                dst.put_u8(b'T');
                dst.put_slice(bytes);
            }
            Command::SetBitMode(mode) => write_fmt_guarded(dst, format_args!("M{}", mode))?,
            Command::RequestBattery => dst.put_u8(b'B'),
            Command::StartAscii => dst.put_u8(b'A'),
            Command::StopAscii => dst.put_u8(b'N'),
            Command::RequestSerialNumber => dst.put_u8(b'@'),
            Command::RequestMaxVoltage => dst.put_u8(b'2'),
            Command::ProgramSerialNumber => dst.put_u8(b'#'),
            Command::SerialNumber(serial) => write_fmt_guarded(dst, format_args!("{}", serial))?,
            Command::SetSmudge(smudge) => write_fmt_guarded(dst, format_args!("X{}", smudge))?,
            Command::Alarm0(enable) => dst.put_u8(if *enable { b'Z' } else { b'z' }),
            Command::Alarm1(enable) => dst.put_u8(if *enable { b'W' } else { b'w' }),
        }
        match item {
            Command::StartAcquire => self.acquiring = true,
            Command::StopAcquire => self.acquiring = false,
            Command::EnterGeiger => self.geiger = true,
            Command::LeaveGeiger => self.geiger = false,
            _ => {}
        }
        self.last_cmd = Some(item);
        Ok(())
    }
}
