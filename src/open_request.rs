use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::endpoint::EndpointShared;
use crate::error::ChannelError;
use crate::frame::{Frame, OpCode};
use crate::mode::ChannelMode;

/// One attempt of an endpoint to open a channel address on a connection.
///
/// A request is created by [crate::endpoint::Endpoint::connect] and then tracked by the
///  connection, either as the request in flight for its address or in that address's wait
///  queue, until it is resolved or cancelled.
pub struct OpenRequest {
    endpoint: Arc<EndpointShared>,
    addr: u32,
    mode: ChannelMode,
    frame: Frame,
    /// Only modified while holding the connection's pending-request lock. The atomic is there
    ///  so the flag can be read without it.
    sent: AtomicBool,
}

impl Debug for OpenRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OPEN{{{}:{:?}{}}}", self.addr, self.mode, if self.is_sent() { ",sent" } else { "" })
    }
}

impl OpenRequest {
    pub fn new(endpoint: Arc<EndpointShared>, addr: u32, mode: ChannelMode, token: Option<Bytes>) -> Result<OpenRequest, ChannelError> {
        let frame = Frame::new(addr, OpCode::Open, mode.bits(), token.unwrap_or_default())?;
        Ok(OpenRequest {
            endpoint,
            addr,
            mode,
            frame,
            sent: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Arc<EndpointShared> {
        &self.endpoint
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// the OPEN frame to send for this request
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Marks the request as sent, returning `true` if it was not marked before: the caller is
    ///  then responsible for actually sending the frame.
    pub fn mark_sent(&self) -> bool {
        !self.sent.swap(true, Ordering::AcqRel)
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }
}
