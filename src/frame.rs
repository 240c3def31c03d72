//! Binary frame layout - all numbers in network byte order (BE):
//!
//! ```ascii
//! 0: total length including this header (u16)
//! 2: reserved, always 0 (u8)
//! 3: address of the channel (u32)
//! 7: opcode in the high nibble, flag in the low nibble (u8)
//! 8: payload (total length - 8 bytes)
//! ```
//!
//! The meaning of the flag depends on the opcode:
//! * OPEN requests carry the channel mode, OPEN responses a status (success, redirect or a
//!    failure category)
//! * DATA frames carry the priority
//! * SIGNAL frames carry the signal type (emit, end or an error category)

use std::fmt::{Debug, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ChannelError;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum OpCode {
    Open = 0x01,
    Data = 0x02,
    Signal = 0x03,
}

/// The fixed-size part of a frame, parsed before the payload is read from the socket.
///
/// The opcode is kept raw: frames with an opcode this client does not know are skipped rather
///  than treated as a broken stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub len: u16,
    pub addr: u32,
    pub op: u8,
    pub flag: u8,
}
impl FrameHeader {
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        if buf.remaining() < Frame::HEADER_LEN {
            bail!("buffer underflow: frame header needs {} bytes, {} available", Frame::HEADER_LEN, buf.remaining());
        }

        let len = buf.get_u16();
        let _reserved = buf.get_u8();
        let addr = buf.get_u32();
        let op_and_flag = buf.get_u8();

        if (len as usize) < Frame::HEADER_LEN {
            bail!("frame length {} is shorter than the frame header", len);
        }

        Ok(FrameHeader {
            len,
            addr,
            op: op_and_flag >> 4,
            flag: op_and_flag & 0x0f,
        })
    }

    pub fn payload_len(&self) -> usize {
        self.len as usize - Frame::HEADER_LEN
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Frame {
    addr: u32,
    op: OpCode,
    flag: u8,
    payload: Bytes,
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FRAME{{{:?}@{}/{:x}:{} bytes}}", self.op, self.addr, self.flag, self.payload.len())
    }
}

impl Frame {
    pub const HEADER_LEN: usize = 8;
    pub const MAX_PAYLOAD_LEN: usize = 10 * 1024;

    pub const OPEN_SUCCESS: u8 = 0x00;
    pub const OPEN_REDIRECT: u8 = 0x01;

    pub const SIG_EMIT: u8 = 0x00;
    pub const SIG_END: u8 = 0x01;

    /// Oversized payloads and flags that do not fit into a nibble are rejected here, so an
    ///  invalid frame never reaches the socket.
    pub fn new(addr: u32, op: OpCode, flag: u8, payload: impl Into<Bytes>) -> Result<Frame, ChannelError> {
        let payload = payload.into();
        if payload.len() > Self::MAX_PAYLOAD_LEN {
            return Err(ChannelError::PayloadTooLarge {
                len: payload.len(),
                max: Self::MAX_PAYLOAD_LEN,
            });
        }
        if flag > 0x0f {
            return Err(ChannelError::InvalidFlag(flag));
        }

        Ok(Frame { addr, op, flag, payload })
    }

    pub fn end_signal(addr: u32) -> Frame {
        Frame {
            addr,
            op: OpCode::Signal,
            flag: Self::SIG_END,
            payload: Bytes::new(),
        }
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn op(&self) -> OpCode {
        self.op
    }

    pub fn flag(&self) -> u8 {
        self.flag
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// total length on the wire, including the header
    pub fn len(&self) -> usize {
        Self::HEADER_LEN + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.len() as u16);
        buf.put_u8(0);
        buf.put_u32(self.addr);
        buf.put_u8((u8::from(self.op) << 4) | self.flag);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let header = FrameHeader::deser(buf)?;
        if buf.remaining() < header.payload_len() {
            bail!("buffer underflow: frame payload needs {} bytes, {} available", header.payload_len(), buf.remaining());
        }
        let op = OpCode::try_from(header.op)
            .map_err(|_| anyhow!("unknown opcode {}", header.op))?;

        let payload = buf.copy_to_bytes(header.payload_len());
        Ok(Frame {
            addr: header.addr,
            op,
            flag: header.flag,
            payload,
        })
    }
}
