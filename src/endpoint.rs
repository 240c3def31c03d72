use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::addr::EndpointAddr;
use crate::connection::Connection;
use crate::error::ChannelError;
use crate::frame::{Frame, OpCode};
use crate::mode::ChannelMode;
use crate::open_request::OpenRequest;
use crate::registry::Registry;
use crate::util::lock;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EndpointState {
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

/// A DATA frame received on a channel
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EndpointData {
    pub priority: u8,
    pub content: Bytes,
}

/// A signal received on a channel
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EndpointSignal {
    pub kind: u8,
    pub content: Bytes,
}

/// The application's handle to one logical channel on a (shared) connection.
///
/// Opening is asynchronous: [Endpoint::connect] returns as soon as the OPEN request is accepted
///  by the connection, and the channel becomes writable once the server confirms it (see
///  [Endpoint::is_connected]). Received data and signals are buffered until the application
///  polls them with [Endpoint::pop_data] and [Endpoint::pop_signal].
///
/// Dropping an endpoint closes it.
pub struct Endpoint {
    shared: Arc<EndpointShared>,
    registry: Arc<Registry>,
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.shared.inner);
        write!(f, "ENDPOINT{{{}:{:?}:{:?}}}", inner.addr, inner.state, inner.mode)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::new()
    }
}

impl Endpoint {
    /// Creates an idle endpoint using the process-wide connection registry
    pub fn new() -> Endpoint {
        Self::with_registry(Registry::global())
    }

    pub fn with_registry(registry: Arc<Registry>) -> Endpoint {
        Endpoint {
            shared: Arc::new(EndpointShared::new()),
            registry,
        }
    }

    /// Parses an address string (see [EndpointAddr::parse]) and connects a new endpoint to it
    pub async fn open(target: &str, mode: ChannelMode) -> Result<Endpoint, ChannelError> {
        let endpoint = Endpoint::new();
        let addr = EndpointAddr::parse(target, endpoint.registry.config())?;
        endpoint.connect(&addr, mode).await?;
        Ok(endpoint)
    }

    /// Requests the channel `target` with `mode`. This is only valid once per endpoint.
    ///
    /// If this is the first channel to the target's host and port, this call establishes the
    ///  connection and performs the handshake before it returns. Failures to do so are returned
    ///  here as well as recorded as the endpoint's error.
    pub async fn connect(&self, target: &EndpointAddr, mode: ChannelMode) -> Result<(), ChannelError> {
        let mode = mode.validate()?;
        if target.address == 0 {
            return Err(ChannelError::BroadcastAddress);
        }
        if lock(&self.shared.inner).state != EndpointState::Idle {
            return Err(ChannelError::AlreadyConnected);
        }

        let request = Arc::new(OpenRequest::new(self.shared.clone(), target.address, mode, target.token.clone())?);
        let connection = self.registry.get_connection(&target.host, target.port);

        {
            let mut inner = lock(&self.shared.inner);
            if inner.state != EndpointState::Idle {
                drop(inner);
                connection.dealloc_endpoint(0, &self.shared);
                return Err(ChannelError::AlreadyConnected);
            }

            inner.state = EndpointState::Opening;
            inner.mode = mode;
            inner.readable = mode.is_readable();
            inner.writable = mode.is_writable();
            inner.emitable = mode.is_emitable();
            inner.addr = target.address;
            inner.connection = Some(connection.clone());
            inner.open_request = Some(request.clone());
        }

        debug!(addr = target.address, "requesting channel {} in mode {:?}", target, mode);

        if let Err(e) = connection.request_open(request).await {
            let previous = self.shared.error();
            self.shared.destroy(Some(e.clone()));
            return Err(previous.unwrap_or(e));
        }

        let inner = lock(&self.shared.inner);
        if inner.state == EndpointState::Closed {
            return Err(inner.error.clone().unwrap_or(ChannelError::NotConnected));
        }
        Ok(())
    }

    /// Sends data with a priority between 1 and 3
    pub async fn write(&self, payload: impl Into<Bytes>, priority: u8) -> Result<(), ChannelError> {
        let (connection, addr) = {
            let inner = lock(&self.shared.inner);
            let connection = inner.connection_if_confirmed()?;
            if !inner.writable {
                return Err(ChannelError::NotWritable);
            }
            if !(1..=3).contains(&priority) {
                return Err(ChannelError::InvalidPriority(priority));
            }
            (connection, inner.addr)
        };

        let frame = Frame::new(addr, OpCode::Data, priority, payload)?;
        self.send(&connection, frame).await
    }

    pub async fn write_bytes(&self, payload: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.write(payload, 1).await
    }

    pub async fn write_str(&self, value: &str) -> Result<(), ChannelError> {
        self.write(Bytes::copy_from_slice(value.as_bytes()), 1).await
    }

    /// Sends a signal of type `signal_type` (which must fit into four bits)
    pub async fn emit(&self, payload: impl Into<Bytes>, signal_type: u8) -> Result<(), ChannelError> {
        let (connection, addr) = {
            let inner = lock(&self.shared.inner);
            let connection = inner.connection_if_confirmed()?;
            if !inner.emitable {
                return Err(ChannelError::NotEmittable);
            }
            (connection, inner.addr)
        };

        let frame = Frame::new(addr, OpCode::Signal, signal_type, payload)?;
        self.send(&connection, frame).await
    }

    pub async fn emit_str(&self, value: &str) -> Result<(), ChannelError> {
        self.emit(Bytes::copy_from_slice(value.as_bytes()), Frame::SIG_EMIT).await
    }

    async fn send(&self, connection: &Connection, frame: Frame) -> Result<(), ChannelError> {
        match connection.write_frame(frame).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.shared.error().unwrap_or(e)),
        }
    }

    /// Closes the channel. Closing an endpoint that is closing or closed already has no effect.
    ///
    /// An OPEN request that was not sent yet is simply discarded. If it was sent, the END
    ///  signal is sent as soon as the server responded to it. In all other cases the server is
    ///  sent an END signal right away, and the endpoint is destroyed when the server confirms
    ///  that.
    pub async fn close(&self) -> Result<(), ChannelError> {
        match self.shared.begin_close() {
            Some((connection, frame)) => connection.write_frame(frame).await,
            None => Ok(()),
        }
    }

    pub fn pop_data(&self) -> Option<EndpointData> {
        lock(&self.shared.data).pop_front()
    }

    pub fn pop_signal(&self) -> Option<EndpointSignal> {
        lock(&self.shared.signals).pop_front()
    }

    pub fn is_data_empty(&self) -> bool {
        lock(&self.shared.data).is_empty()
    }

    pub fn is_signal_empty(&self) -> bool {
        lock(&self.shared.signals).is_empty()
    }

    pub fn state(&self) -> EndpointState {
        lock(&self.shared.inner).state
    }

    /// the channel address, which is the address confirmed by the server once the channel is open
    pub fn address(&self) -> u32 {
        lock(&self.shared.inner).addr
    }

    /// `true` once the server confirmed the channel, until the endpoint is destroyed
    pub fn is_connected(&self) -> bool {
        lock(&self.shared.inner).confirmed
    }

    pub fn is_closing(&self) -> bool {
        self.shared.is_closing()
    }

    pub fn is_readable(&self) -> bool {
        let inner = lock(&self.shared.inner);
        inner.confirmed && inner.readable
    }

    pub fn is_writable(&self) -> bool {
        let inner = lock(&self.shared.inner);
        inner.confirmed && inner.writable
    }

    pub fn has_signal_support(&self) -> bool {
        let inner = lock(&self.shared.inner);
        inner.confirmed && inner.emitable
    }

    /// the first error that occurred on this endpoint, if any
    pub fn error(&self) -> Option<ChannelError> {
        self.shared.error()
    }

    pub fn check_error(&self) -> Result<(), ChannelError> {
        match self.shared.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some((connection, frame)) = self.shared.begin_close() {
            connection.send_frame(frame);
        }
    }
}

/// The part of an endpoint that is shared with its connection.
///
/// Queues have their own locks so that draining them never contends with writes or with the
///  connection's dispatch of state changes.
pub struct EndpointShared {
    inner: Mutex<EndpointInner>,
    data: Mutex<VecDeque<EndpointData>>,
    signals: Mutex<VecDeque<EndpointSignal>>,
}

struct EndpointInner {
    state: EndpointState,
    addr: u32,
    mode: ChannelMode,
    readable: bool,
    writable: bool,
    emitable: bool,
    /// set when the server confirmed `addr`, cleared when the endpoint is destroyed
    confirmed: bool,
    connection: Option<Arc<Connection>>,
    /// Present from `connect` until the OPEN request is resolved. A state of `Closing` while
    ///  this is still present means the close is deferred until the response arrives.
    open_request: Option<Arc<OpenRequest>>,
    error: Option<ChannelError>,
}

impl EndpointInner {
    fn connection_if_confirmed(&self) -> Result<Arc<Connection>, ChannelError> {
        match (&self.connection, self.confirmed) {
            (Some(connection), true) => Ok(connection.clone()),
            _ => Err(self.error.clone().unwrap_or(ChannelError::NotConnected)),
        }
    }
}

impl EndpointShared {
    pub(crate) fn new() -> EndpointShared {
        EndpointShared {
            inner: Mutex::new(EndpointInner {
                state: EndpointState::Idle,
                addr: 0,
                mode: ChannelMode::LISTEN,
                readable: false,
                writable: false,
                emitable: false,
                confirmed: false,
                connection: None,
                open_request: None,
                error: None,
            }),
            data: Default::default(),
            signals: Default::default(),
        }
    }

    pub(crate) fn error(&self) -> Option<ChannelError> {
        lock(&self.inner).error.clone()
    }

    pub(crate) fn is_closing(&self) -> bool {
        lock(&self.inner).state == EndpointState::Closing
    }

    pub(crate) fn add_data(&self, data: EndpointData) {
        lock(&self.data).push_back(data);
    }

    pub(crate) fn add_signal(&self, signal: EndpointSignal) {
        lock(&self.signals).push_back(signal);
    }

    /// Called by the connection when the server confirmed this endpoint's OPEN request under
    ///  `resolved`. Returns `false` if the endpoint has no outstanding request anymore.
    pub(crate) fn open_success(&self, resolved: u32) -> bool {
        let pending_close = {
            let mut inner = lock(&self.inner);
            if inner.open_request.take().is_none() {
                return false;
            }

            inner.addr = resolved;
            inner.confirmed = true;
            if inner.state == EndpointState::Closing {
                inner.connection.clone()
            }
            else {
                inner.state = EndpointState::Open;
                None
            }
        };

        if let Some(connection) = pending_close {
            debug!(addr = resolved, "sending deferred END signal");
            connection.send_frame(Frame::end_signal(resolved));
        }
        true
    }

    /// Moves the endpoint to `Closed`, releasing its reference to the connection. The first
    ///  error recorded on an endpoint is kept.
    pub(crate) fn destroy(self: &Arc<Self>, error: Option<ChannelError>) {
        let (connection, dealloc_addr) = {
            let mut inner = lock(&self.inner);
            if inner.error.is_none() {
                inner.error = error;
            }
            if inner.state == EndpointState::Closed {
                return;
            }

            let dealloc_addr = if inner.confirmed { inner.addr } else { 0 };
            trace!(addr = inner.addr, "destroying endpoint in state {:?}: {:?}", inner.state, inner.error);

            inner.state = EndpointState::Closed;
            inner.addr = 0;
            inner.confirmed = false;
            inner.readable = false;
            inner.writable = false;
            inner.emitable = false;
            inner.open_request = None;
            (inner.connection.take(), dealloc_addr)
        };

        if let Some(connection) = connection {
            connection.dealloc_endpoint(dealloc_addr, self);
        }
    }

    /// Moves the endpoint to `Closing` and cancels or defers a pending OPEN request. Returns
    ///  the connection and END signal if the signal needs to be sent by the caller.
    fn begin_close(self: &Arc<Self>) -> Option<(Arc<Connection>, Frame)> {
        let (connection, request, addr) = {
            let mut inner = lock(&self.inner);
            match inner.state {
                EndpointState::Idle | EndpointState::Closing | EndpointState::Closed => return None,
                EndpointState::Opening | EndpointState::Open => {}
            }

            inner.state = EndpointState::Closing;
            inner.readable = false;
            inner.writable = false;
            inner.emitable = false;
            (inner.connection.clone()?, inner.open_request.clone(), inner.addr)
        };

        match request {
            Some(request) => {
                if connection.cancel_open(&request) {
                    debug!(addr, "open request cancelled before it was sent");
                    self.destroy(None);
                }
                else {
                    debug!(addr, "open request in flight, deferring END signal");
                }
                None
            }
            None => {
                debug!(addr, "sending END signal");
                Some((connection, Frame::end_signal(addr)))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use rstest::rstest;

    use crate::config::MuxConfig;
    use crate::frame::OpCode;
    use crate::test_util::{wait_until, FakeServer};
    use super::*;

    fn registry() -> Arc<Registry> {
        Registry::new(MuxConfig::default()).unwrap()
    }

    #[rstest]
    #[case::emit_only(ChannelMode::EMIT)]
    #[case::undefined_bit(ChannelMode::from_bits_retain(8))]
    #[tokio::test]
    async fn test_connect_invalid_mode(#[case] mode: ChannelMode) {
        let registry = registry();
        let endpoint = Endpoint::with_registry(registry.clone());

        let result = endpoint.connect(&EndpointAddr::new("127.0.0.1", 1, 5), mode).await;
        assert!(matches!(result, Err(ChannelError::InvalidMode(_))));
        assert_eq!(endpoint.state(), EndpointState::Idle);
        assert!(registry.is_empty());
    }

    #[rstest]
    #[case::listen(ChannelMode::LISTEN, false, false, false)]
    #[case::read(ChannelMode::READ, true, false, false)]
    #[case::write(ChannelMode::WRITE, false, true, false)]
    #[case::readwrite(ChannelMode::READWRITE, true, true, false)]
    #[case::read_emit(ChannelMode::READ_EMIT, true, false, true)]
    #[case::write_emit(ChannelMode::WRITE_EMIT, false, true, true)]
    #[case::all(ChannelMode::READWRITE_EMIT, true, true, true)]
    #[tokio::test]
    async fn test_connect_capabilities(#[case] mode: ChannelMode, #[case] readable: bool, #[case] writable: bool, #[case] emitable: bool) {
        let server = FakeServer::start().await.unwrap();
        let endpoint = Endpoint::with_registry(registry());
        let target = server.endpoint_addr(3);

        let server_task = tokio::spawn(async move {
            let mut peer = server.accept_handshaked().await.unwrap();
            let open = peer.read_frame().await.unwrap();
            assert_eq!(open.flag(), mode.bits());
            peer.send_frame(&Frame::new(open.addr(), OpCode::Open, Frame::OPEN_SUCCESS, Bytes::new()).unwrap()).await.unwrap();
            peer
        });

        endpoint.connect(&target, mode).await.unwrap();
        let _peer = server_task.await.unwrap();
        assert!(wait_until(|| endpoint.is_connected()).await);

        assert_eq!(endpoint.is_readable(), readable);
        assert_eq!(endpoint.is_writable(), writable);
        assert_eq!(endpoint.has_signal_support(), emitable);
        assert_eq!(endpoint.state(), EndpointState::Open);
    }

    #[tokio::test]
    async fn test_connect_twice() {
        let server = FakeServer::start().await.unwrap();
        let endpoint = Endpoint::with_registry(registry());
        let target = server.endpoint_addr(1);

        let server_task = tokio::spawn(async move {
            server.accept_handshaked().await.unwrap()
        });

        endpoint.connect(&target, ChannelMode::READ).await.unwrap();
        assert_eq!(endpoint.connect(&target, ChannelMode::READ).await, Err(ChannelError::AlreadyConnected));
        let _peer = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_before_open() {
        let endpoint = Endpoint::with_registry(registry());
        assert_eq!(endpoint.write_str("x").await, Err(ChannelError::NotConnected));
        assert_eq!(endpoint.emit_str("x").await, Err(ChannelError::NotConnected));
    }

    #[tokio::test]
    async fn test_usage_errors_when_open() {
        let server = FakeServer::start().await.unwrap();
        let endpoint = Endpoint::with_registry(registry());
        let target = server.endpoint_addr(7);

        let server_task = tokio::spawn(async move {
            let mut peer = server.accept_handshaked().await.unwrap();
            let open = peer.read_frame().await.unwrap();
            peer.send_frame(&Frame::new(open.addr(), OpCode::Open, Frame::OPEN_SUCCESS, Bytes::new()).unwrap()).await.unwrap();
            peer
        });

        endpoint.connect(&target, ChannelMode::READ).await.unwrap();
        let _peer = server_task.await.unwrap();
        assert!(wait_until(|| endpoint.is_connected()).await);

        assert_eq!(endpoint.write_str("x").await, Err(ChannelError::NotWritable));
        assert_eq!(endpoint.emit_str("x").await, Err(ChannelError::NotEmittable));
    }

    #[rstest]
    #[case::zero(0)]
    #[case::four(4)]
    #[case::max(255)]
    #[tokio::test]
    async fn test_write_invalid_priority(#[case] priority: u8) {
        let server = FakeServer::start().await.unwrap();
        let endpoint = Endpoint::with_registry(registry());
        let target = server.endpoint_addr(7);

        let server_task = tokio::spawn(async move {
            let mut peer = server.accept_handshaked().await.unwrap();
            let open = peer.read_frame().await.unwrap();
            peer.send_frame(&Frame::new(open.addr(), OpCode::Open, Frame::OPEN_SUCCESS, Bytes::new()).unwrap()).await.unwrap();
            peer
        });

        endpoint.connect(&target, ChannelMode::READWRITE).await.unwrap();
        let mut peer = server_task.await.unwrap();
        assert!(wait_until(|| endpoint.is_connected()).await);

        assert_eq!(endpoint.write(Bytes::from_static(b"x"), priority).await, Err(ChannelError::InvalidPriority(priority)));
        endpoint.write(Bytes::from_static(b"y"), 3).await.unwrap();

        let data = peer.read_frame().await.unwrap();
        assert_eq!(data.flag(), 3);
        assert_eq!(data.payload().as_ref(), b"y");
    }

    #[tokio::test]
    async fn test_close_open_endpoint() {
        let server = FakeServer::start().await.unwrap();
        let registry = registry();
        let endpoint = Endpoint::with_registry(registry.clone());
        let target = server.endpoint_addr(9);

        let server_task = tokio::spawn(async move {
            let mut peer = server.accept_handshaked().await.unwrap();
            let open = peer.read_frame().await.unwrap();
            peer.send_frame(&Frame::new(open.addr(), OpCode::Open, Frame::OPEN_SUCCESS, Bytes::new()).unwrap()).await.unwrap();
            peer
        });

        endpoint.connect(&target, ChannelMode::READWRITE_EMIT).await.unwrap();
        let mut peer = server_task.await.unwrap();
        assert!(wait_until(|| endpoint.is_connected()).await);

        endpoint.close().await.unwrap();
        assert!(endpoint.is_closing());
        assert!(!endpoint.is_writable());
        assert_eq!(endpoint.write_str("late").await, Err(ChannelError::NotWritable));

        // idempotent: no second END signal
        endpoint.close().await.unwrap();

        let end = peer.read_frame().await.unwrap();
        assert_eq!(end, Frame::end_signal(9));

        peer.send_frame(&Frame::end_signal(9)).await.unwrap();
        assert!(wait_until(|| endpoint.state() == EndpointState::Closed).await);
        assert_eq!(endpoint.error(), None);

        // last endpoint gone, so the connection is torn down
        assert!(wait_until(|| registry.is_empty()).await);
        peer.expect_closed().await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_data_and_signals() {
        let server = FakeServer::start().await.unwrap();
        let endpoint = Endpoint::with_registry(registry());
        let target = server.endpoint_addr(0x20);

        let server_task = tokio::spawn(async move {
            let mut peer = server.accept_handshaked().await.unwrap();
            let open = peer.read_frame().await.unwrap();
            peer.send_frame(&Frame::new(open.addr(), OpCode::Open, Frame::OPEN_SUCCESS, Bytes::new()).unwrap()).await.unwrap();
            peer.send_frame(&Frame::new(0x20, OpCode::Data, 2, Bytes::from_static(b"first")).unwrap()).await.unwrap();
            peer.send_frame(&Frame::new(0x20, OpCode::Signal, Frame::SIG_EMIT, Bytes::from_static(b"sig")).unwrap()).await.unwrap();
            peer.send_frame(&Frame::new(0x20, OpCode::Data, 1, Bytes::from_static(b"second")).unwrap()).await.unwrap();
            peer
        });

        assert!(endpoint.is_data_empty());
        endpoint.connect(&target, ChannelMode::READ).await.unwrap();
        let _peer = server_task.await.unwrap();

        assert!(wait_until(|| !endpoint.is_signal_empty()).await);
        assert!(wait_until(|| lock(&endpoint.shared.data).len() == 2).await);

        assert_eq!(endpoint.pop_data(), Some(EndpointData { priority: 2, content: Bytes::from_static(b"first") }));
        assert_eq!(endpoint.pop_data(), Some(EndpointData { priority: 1, content: Bytes::from_static(b"second") }));
        assert_eq!(endpoint.pop_data(), None);
        assert_eq!(endpoint.pop_signal(), Some(EndpointSignal { kind: 0, content: Bytes::from_static(b"sig") }));
        assert_eq!(endpoint.pop_signal(), None);
        assert!(endpoint.is_data_empty());
        assert!(endpoint.is_signal_empty());
    }

    #[tokio::test]
    async fn test_signal_error_destroys_endpoint() {
        let server = FakeServer::start().await.unwrap();
        let registry = registry();
        let endpoint = Endpoint::with_registry(registry.clone());
        let target = server.endpoint_addr(4);

        let server_task = tokio::spawn(async move {
            let mut peer = server.accept_handshaked().await.unwrap();
            let open = peer.read_frame().await.unwrap();
            peer.send_frame(&Frame::new(open.addr(), OpCode::Open, Frame::OPEN_SUCCESS, Bytes::new()).unwrap()).await.unwrap();
            peer
        });

        endpoint.connect(&target, ChannelMode::READWRITE).await.unwrap();
        let mut peer = server_task.await.unwrap();
        assert!(wait_until(|| endpoint.is_connected()).await);

        peer.send_frame(&Frame::new(4, OpCode::Signal, 0x0c, Bytes::from_static(b"slow down")).unwrap()).await.unwrap();

        // the client confirms with an END signal
        assert_eq!(peer.read_frame().await.unwrap(), Frame::end_signal(4));

        assert!(wait_until(|| endpoint.state() == EndpointState::Closed).await);
        let error = endpoint.error().unwrap();
        assert_eq!(error.to_string(), "slow down");
        assert_eq!(error.code(), Some(0x0c));
        assert_eq!(endpoint.check_error(), Err(error.clone()));
        assert_eq!(endpoint.write_str("x").await, Err(error));
    }

    #[tokio::test]
    async fn test_drop_sends_end() {
        let server = FakeServer::start().await.unwrap();
        let registry = registry();
        let endpoint = Endpoint::with_registry(registry.clone());
        let target = server.endpoint_addr(12);

        let server_task = tokio::spawn(async move {
            let mut peer = server.accept_handshaked().await.unwrap();
            let open = peer.read_frame().await.unwrap();
            peer.send_frame(&Frame::new(open.addr(), OpCode::Open, Frame::OPEN_SUCCESS, Bytes::new()).unwrap()).await.unwrap();
            peer
        });

        endpoint.connect(&target, ChannelMode::READ).await.unwrap();
        let mut peer = server_task.await.unwrap();
        assert!(wait_until(|| endpoint.is_connected()).await);

        drop(endpoint);
        assert_eq!(tokio::time::timeout(Duration::from_secs(5), peer.read_frame()).await.unwrap().unwrap(), Frame::end_signal(12));
        assert_eq!(registry.len(), 1);

        peer.send_frame(&Frame::end_signal(12)).await.unwrap();
        assert!(wait_until(|| registry.is_empty()).await);
    }

    #[tokio::test]
    async fn test_open_global_registry() {
        let server = FakeServer::start().await.unwrap();
        let port = server.port();

        let server_task = tokio::spawn(async move {
            let mut peer = server.accept_handshaked().await.unwrap();
            let open = peer.read_frame().await.unwrap();
            assert_eq!(open.addr(), 0x1f);
            assert_eq!(open.payload().as_ref(), b"token");
            peer.send_frame(&Frame::new(open.addr(), OpCode::Open, Frame::OPEN_SUCCESS, Bytes::new()).unwrap()).await.unwrap();
            peer
        });

        let endpoint = Endpoint::open(&format!("127.0.0.1:{}/x1f?token", port), ChannelMode::READ).await.unwrap();
        let _peer = server_task.await.unwrap();
        assert!(wait_until(|| endpoint.is_connected()).await);
        assert_eq!(endpoint.address(), 0x1f);
        assert!(Registry::global().contains("127.0.0.1", port));
    }

    #[tokio::test]
    async fn test_connect_broadcast_address() {
        let registry = registry();
        let endpoint = Endpoint::with_registry(registry.clone());

        assert_eq!(endpoint.connect(&EndpointAddr::new("127.0.0.1", 1, 0), ChannelMode::READ).await, Err(ChannelError::BroadcastAddress));
        assert_eq!(endpoint.state(), EndpointState::Idle);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_open_invalid_address() {
        assert_eq!(Endpoint::open("localhost/abc", ChannelMode::READ).await.err(), Some(ChannelError::InvalidAddress("abc".to_string())));
    }
}
