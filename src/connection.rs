use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, span, trace, warn, Instrument, Level};

use crate::config::MuxConfig;
use crate::endpoint::{EndpointData, EndpointShared, EndpointSignal};
use crate::error::{ChannelError, HandshakeErrorKind, OpenErrorKind, SignalErrorKind};
use crate::events::MuxEvent;
use crate::frame::{Frame, FrameHeader, OpCode};
use crate::open_request::OpenRequest;
use crate::registry::Registry;
use crate::util::lock;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum HandshakeState {
    Idle,
    Connecting,
    Handshaked,
}

/// Where a connection is in its teardown. `Closing` is held while a broadcast signal is
///  delivered to all channels, and it suppresses destruction through the reference count
///  until the sweep is complete.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Teardown {
    Active,
    Closing,
    Destroying,
    Destroyed,
}

struct Lifecycle {
    handshake: HandshakeState,
    teardown: Teardown,
    /// number of endpoints using this connection, whether their channel is open or not
    ref_count: usize,
}

struct Outbound {
    frame: Frame,
    ack: Option<oneshot::Sender<Result<(), ChannelError>>>,
}

enum OpenAction {
    Queued,
    AwaitHandshake,
    Handshake,
    Send,
}

/// The single TCP connection to a server (`host`, `port`) that all channels to that server
///  share.
///
/// The connection performs the handshake when the first channel is requested, arbitrates OPEN
///  requests so that there is never more than one request in flight per channel address,
///  and dispatches received frames to the channels' endpoints. It destroys itself when the
///  last endpoint using it is gone, or when a connection-level error occurs.
///
/// Received frames are processed by a single reader task, outgoing frames are written by a
///  single writer task in the order they are submitted.
///
/// Lock order: `pending`, then `wait_queue`, then `open_endpoints` or `lifecycle`. No lock is
///  held while calling into an endpoint or the registry.
pub struct Connection {
    host: String,
    port: u16,
    config: Arc<MuxConfig>,
    registry: Weak<Registry>,
    lifecycle: Mutex<Lifecycle>,
    /// the request in flight (or waiting for the handshake) per address
    pending: Mutex<FxHashMap<u32, Arc<OpenRequest>>>,
    /// requests waiting for the pending request of the same address to be resolved
    wait_queue: Mutex<FxHashMap<u32, VecDeque<Arc<OpenRequest>>>>,
    open_endpoints: Mutex<FxHashMap<u32, Arc<EndpointShared>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    shutdown: watch::Sender<bool>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let lifecycle = lock(&self.lifecycle);
        write!(f, "CONNECTION{{{}:{}:{:?}/{:?}:{} refs}}", self.host, self.port, lifecycle.handshake, lifecycle.teardown, lifecycle.ref_count)
    }
}

impl Connection {
    const HANDSHAKE_RESPONSE_LEN: usize = 5;

    pub(crate) fn new(host: &str, port: u16, config: Arc<MuxConfig>, registry: Weak<Registry>) -> Arc<Connection> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Connection {
            host: host.to_string(),
            port,
            config,
            registry,
            lifecycle: Mutex::new(Lifecycle {
                handshake: HandshakeState::Idle,
                teardown: Teardown::Active,
                ref_count: 0,
            }),
            pending: Default::default(),
            wait_queue: Default::default(),
            open_endpoints: Default::default(),
            outbound: Default::default(),
            shutdown,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ref_count(&self) -> usize {
        lock(&self.lifecycle).ref_count
    }

    pub fn is_handshaked(&self) -> bool {
        lock(&self.lifecycle).handshake == HandshakeState::Handshaked
    }

    pub fn teardown_state(&self) -> Teardown {
        lock(&self.lifecycle).teardown
    }

    fn is_torn_down(&self) -> bool {
        matches!(self.teardown_state(), Teardown::Destroying | Teardown::Destroyed)
    }

    fn event(&self, event: MuxEvent, addr: u32) {
        self.config.event_listener.on_event(event, addr);
    }

    /// Registers an additional endpoint. Returns `false` if the connection is being destroyed
    ///  and can not take new endpoints.
    pub(crate) fn alloc_endpoint(&self) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        match lifecycle.teardown {
            Teardown::Destroying | Teardown::Destroyed => false,
            Teardown::Active | Teardown::Closing => {
                lifecycle.ref_count += 1;
                trace!("allocating endpoint, ref count is now {}", lifecycle.ref_count);
                true
            }
        }
    }

    /// Unregisters a destroyed endpoint. `addr` is the endpoint's confirmed address, or 0 if
    ///  its channel was never opened.
    pub(crate) fn dealloc_endpoint(&self, addr: u32, endpoint: &Arc<EndpointShared>) {
        if addr != 0 && self.teardown_state() == Teardown::Active {
            self.remove_open_endpoint(addr, endpoint);
        }

        {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.ref_count = lifecycle.ref_count.saturating_sub(1);
            trace!(addr, "deallocating endpoint, ref count is now {}", lifecycle.ref_count);
        }

        self.event(MuxEvent::EndpointDestroyed, addr);
        self.check_ref_count();
    }

    fn check_ref_count(&self) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.ref_count != 0 || lifecycle.teardown != Teardown::Active {
                return;
            }
            lifecycle.teardown = Teardown::Destroying;
        }

        debug!("no more endpoints, closing connection to {}:{}", self.host, self.port);
        self.teardown(None);
    }

    fn remove_open_endpoint(&self, addr: u32, endpoint: &Arc<EndpointShared>) {
        let mut open_endpoints = lock(&self.open_endpoints);
        if open_endpoints.get(&addr).is_some_and(|e| Arc::ptr_eq(e, endpoint)) {
            open_endpoints.remove(&addr);
            trace!(addr, "removed open endpoint, {} left", open_endpoints.len());
        }
    }

    /// Submits an OPEN request.
    ///
    /// The request is rejected if its address is open already. If another request for the same
    ///  address is in flight, it is queued behind that request. Otherwise it is sent, after
    ///  establishing the connection if this is the first request.
    ///
    /// If this call establishes the connection, it returns after the handshake, and a failed
    ///  handshake is returned as an error (after destroying the connection).
    pub(crate) async fn request_open(self: &Arc<Self>, request: Arc<OpenRequest>) -> Result<(), ChannelError> {
        let addr = request.addr();

        let action = {
            let mut pending = lock(&self.pending);
            if lock(&self.open_endpoints).contains_key(&addr) {
                debug!(addr, "channel is open already, rejecting open request");
                return Err(ChannelError::AlreadyOpen);
            }

            if pending.contains_key(&addr) {
                lock(&self.wait_queue)
                    .entry(addr)
                    .or_default()
                    .push_back(request.clone());
                OpenAction::Queued
            }
            else {
                let mut lifecycle = lock(&self.lifecycle);
                if matches!(lifecycle.teardown, Teardown::Destroying | Teardown::Destroyed) {
                    return Err(ChannelError::Transport("Connection was closed".to_string()));
                }

                pending.insert(addr, request.clone());
                match lifecycle.handshake {
                    HandshakeState::Idle => {
                        lifecycle.handshake = HandshakeState::Connecting;
                        OpenAction::Handshake
                    }
                    HandshakeState::Connecting => OpenAction::AwaitHandshake,
                    HandshakeState::Handshaked => {
                        request.mark_sent();
                        OpenAction::Send
                    }
                }
            }
        };

        match action {
            OpenAction::Queued => {
                debug!(addr, "open request in flight for the same address, queueing");
                self.event(MuxEvent::OpenQueued, addr);
                Ok(())
            }
            OpenAction::AwaitHandshake => {
                debug!(addr, "connection not handshaked yet, open request is sent afterwards");
                Ok(())
            }
            OpenAction::Send => {
                debug!(addr, "sending open request");
                self.send_frame(request.frame().clone());
                self.event(MuxEvent::OpenSent, addr);
                Ok(())
            }
            OpenAction::Handshake => {
                // in a separate task so that the handshake completes even if the caller goes away
                let connection = self.clone();
                match tokio::spawn(async move { connection.connect_and_handshake().await }).await {
                    Ok(result) => result,
                    Err(e) => {
                        let error = ChannelError::Transport(format!("Connection task failed: {}", e));
                        self.destroy(Some(error.clone()));
                        Err(error)
                    }
                }
            }
        }
    }

    /// Withdraws an OPEN request that was not sent yet. Returns `false` if the request was
    ///  sent already (or is unknown to this connection).
    pub(crate) fn cancel_open(&self, request: &Arc<OpenRequest>) -> bool {
        let addr = request.addr();

        let mut pending = lock(&self.pending);
        if request.is_sent() {
            return false;
        }

        let mut wait_queue = lock(&self.wait_queue);
        if pending.get(&addr).is_some_and(|r| Arc::ptr_eq(r, request)) {
            // the promoted request is sent as part of the handshake
            promote_next(&mut pending, &mut wait_queue, addr);
            return true;
        }

        if let Some(queue) = wait_queue.get_mut(&addr) {
            if let Some(pos) = queue.iter().position(|r| Arc::ptr_eq(r, request)) {
                queue.remove(pos);
                if queue.is_empty() {
                    wait_queue.remove(&addr);
                }
                return true;
            }
        }
        false
    }

    async fn connect_and_handshake(self: Arc<Self>) -> Result<(), ChannelError> {
        self.event(MuxEvent::Connecting, 0);
        match self.handshake().await {
            Ok(stream) => {
                self.start(stream);
                Ok(())
            }
            Err(e) => {
                info!("connection to {}:{} failed: {}", self.host, self.port, e);
                self.destroy(Some(e.clone()));
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<TcpStream, ChannelError> {
        let host_len = u8::try_from(self.host.len())
            .map_err(|_| ChannelError::Transport("Could not send handshake".to_string()))?;

        debug!("connecting to {}:{}", self.host, self.port);
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await
            .map_err(|e| {
                debug!("connect failed: {}", e);
                ChannelError::Transport(format!("Could not connect to the host \"{}\"", self.host))
            })?;

        if self.config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("could not set TCP_NODELAY: {}", e);
            }
        }

        let mut buf = BytesMut::with_capacity(5 + self.host.len());
        buf.put_slice(&self.config.handshake_magic);
        buf.put_u8(host_len);
        buf.put_slice(self.host.as_bytes());
        stream.write_all(&buf).await
            .map_err(|_| ChannelError::Transport("Could not send handshake".to_string()))?;

        let mut response = [0u8; Self::HANDSHAKE_RESPONSE_LEN];
        stream.read_exact(&mut response).await
            .map_err(|_| ChannelError::Transport("Server responded with bad handshake".to_string()))?;

        if response[..4] != self.config.handshake_magic {
            return Err(ChannelError::Protocol("Server responded with bad handshake".to_string()));
        }
        match response[4] {
            0 => Ok(stream),
            status => Err(ChannelError::handshake(HandshakeErrorKind::from(status))),
        }
    }

    /// Starts the I/O tasks on a handshaked socket and flushes the OPEN requests that were
    ///  submitted while connecting.
    fn start(self: &Arc<Self>, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        self.spawn_writer(writer);
        let read_shutdown = self.shutdown.subscribe();

        {
            let mut lifecycle = lock(&self.lifecycle);
            if matches!(lifecycle.teardown, Teardown::Destroying | Teardown::Destroyed) {
                drop(lifecycle);
                *lock(&self.outbound) = None;
                return;
            }
            lifecycle.handshake = HandshakeState::Handshaked;
        }

        debug!("handshake with {}:{} complete", self.host, self.port);
        self.event(MuxEvent::Handshaked, 0);

        let to_send: Vec<Arc<OpenRequest>> = lock(&self.pending)
            .values()
            .filter(|r| r.mark_sent())
            .cloned()
            .collect();
        for request in to_send {
            trace!(addr = request.addr(), "sending open request");
            self.send_frame(request.frame().clone());
            self.event(MuxEvent::OpenSent, request.addr());
        }

        let span = span!(Level::DEBUG, "connection", host = %self.host, port = self.port);
        tokio::spawn(self.clone().read_loop(reader, read_shutdown).instrument(span));
    }

    fn spawn_writer(self: &Arc<Self>, writer: impl AsyncWrite + Unpin + Send + 'static) {
        let (outbound_send, outbound_recv) = mpsc::unbounded_channel();
        *lock(&self.outbound) = Some(outbound_send);
        tokio::spawn(self.clone().write_loop(writer, outbound_recv));
    }

    /// Queues a frame for sending without waiting for it to be written. Returns `false` if the
    ///  connection can not send frames (not handshaked, or destroyed).
    pub(crate) fn send_frame(&self, frame: Frame) -> bool {
        match lock(&self.outbound).as_ref() {
            Some(sender) => sender.send(Outbound { frame, ack: None }).is_ok(),
            None => {
                trace!(addr = frame.addr(), "connection is not writable, discarding {:?}", frame);
                false
            }
        }
    }

    /// Sends a frame and waits until it is written to the socket.
    pub(crate) async fn write_frame(&self, frame: Frame) -> Result<(), ChannelError> {
        let (ack_send, ack_recv) = oneshot::channel();
        {
            let outbound = lock(&self.outbound);
            let sender = outbound.as_ref().ok_or(ChannelError::NotConnected)?;
            sender.send(Outbound { frame, ack: Some(ack_send) })
                .map_err(|_| ChannelError::NotConnected)?;
        }

        ack_recv.await
            .unwrap_or_else(|_| Err(ChannelError::Transport("Could not write to the socket".to_string())))
    }

    /// Writes queued frames until the connection drops its sender. Frames queued before the
    ///  connection was destroyed are still written, e.g. an END echoed to the last channel.
    async fn write_loop(self: Arc<Self>, mut writer: impl AsyncWrite + Unpin, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(msg) = outbound.recv().await {
            trace!(addr = msg.frame.addr(), "writing {:?}", msg.frame);
            match writer.write_all(&msg.frame.to_bytes()).await {
                Ok(()) => {
                    if let Some(ack) = msg.ack {
                        let _ = ack.send(Ok(()));
                    }
                }
                Err(e) => {
                    debug!("write failed: {}", e);
                    let error = ChannelError::Transport("Could not write to the socket".to_string());
                    self.destroy(Some(error.clone()));
                    if let Some(ack) = msg.ack {
                        let _ = ack.send(Err(error));
                    }
                    break;
                }
            }
        }

        let _ = writer.shutdown().await;
        trace!("write loop exited");
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, mut shutdown: watch::Receiver<bool>) {
        debug!("read loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = select! {
                biased;
                _ = shutdown.changed() => break,
                received = read_frame(&mut reader) => received,
            };

            match received {
                Ok((header, payload)) => self.dispatch(header, payload),
                Err(e) => {
                    if !self.is_torn_down() {
                        self.destroy(Some(e));
                    }
                    break;
                }
            }
        }
        debug!("read loop exited");
    }

    fn dispatch(&self, header: FrameHeader, payload: Bytes) {
        trace!(addr = header.addr, "received {:?}", header);
        match OpCode::try_from(header.op) {
            Ok(OpCode::Open) => self.process_open(header.addr, header.flag, payload),
            Ok(OpCode::Data) => self.process_data(header.addr, header.flag, payload),
            Ok(OpCode::Signal) => self.process_signal(header.addr, header.flag, payload),
            Err(_) => debug!(addr = header.addr, "ignoring frame with unknown opcode {}", header.op),
        }
    }

    fn process_open(&self, addr: u32, flag: u8, payload: Bytes) {
        let request = lock(&self.pending).get(&addr).cloned();
        let Some(request) = request else {
            self.destroy(Some(ChannelError::Protocol("The server sent an invalid open frame".to_string())));
            return;
        };

        let resolved = match flag {
            Frame::OPEN_SUCCESS => addr,
            Frame::OPEN_REDIRECT => {
                if payload.len() < 4 {
                    self.destroy(Some(ChannelError::Protocol("Expected redirect address from the server".to_string())));
                    return;
                }
                let resolved = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                debug!(addr, "open request redirected to {}", resolved);
                self.event(MuxEvent::Redirected, resolved);
                resolved
            }
            _ => {
                self.reject_open(&request, flag, &payload);
                return;
            }
        };

        if resolved == 0 {
            self.destroy(Some(ChannelError::Protocol("Server redirected to the broadcast address".to_string())));
            return;
        }

        // registering the channel and retiring the request happen under one lock, so a
        //  concurrent request_open sees the address either pending or open
        let endpoint = request.endpoint().clone();
        let (obsolete, promoted) = {
            let mut pending = lock(&self.pending);
            let mut wait_queue = lock(&self.wait_queue);
            if !pending.get(&addr).is_some_and(|r| Arc::ptr_eq(r, &request)) {
                trace!(addr, "open request was withdrawn in the meantime");
                return;
            }

            {
                let mut open_endpoints = lock(&self.open_endpoints);
                if open_endpoints.contains_key(&resolved) {
                    drop(open_endpoints);
                    drop(wait_queue);
                    drop(pending);
                    self.destroy(Some(ChannelError::Protocol("Server redirected to open channel".to_string())));
                    return;
                }
                open_endpoints.insert(resolved, endpoint.clone());
            }

            if resolved == addr {
                pending.remove(&addr);
                (wait_queue.remove(&addr).unwrap_or_default(), None)
            }
            else {
                let next = promote_next(&mut pending, &mut wait_queue, addr)
                    .filter(|r| r.mark_sent());
                (VecDeque::new(), next)
            }
        };

        if endpoint.open_success(resolved) {
            debug!(addr = resolved, "channel open");
            self.event(MuxEvent::Opened, resolved);
        }
        else {
            self.remove_open_endpoint(resolved, &endpoint);
        }

        for request in obsolete {
            debug!(addr, "channel opened by a previous request, rejecting queued request");
            request.endpoint().destroy(Some(ChannelError::AlreadyOpen));
        }
        if let Some(next) = promoted {
            debug!(addr, "sending queued open request");
            self.send_frame(next.frame().clone());
            self.event(MuxEvent::OpenSent, addr);
        }
    }

    fn reject_open(&self, request: &Arc<OpenRequest>, flag: u8, payload: &Bytes) {
        let addr = request.addr();
        let promoted = {
            let mut pending = lock(&self.pending);
            let mut wait_queue = lock(&self.wait_queue);
            if pending.get(&addr).is_some_and(|r| Arc::ptr_eq(r, request)) {
                promote_next(&mut pending, &mut wait_queue, addr)
                    .filter(|r| r.mark_sent())
            }
            else {
                None
            }
        };

        let error = ChannelError::open(OpenErrorKind::from(flag), &String::from_utf8_lossy(payload));
        debug!(addr, "open request rejected: {}", error);
        self.event(MuxEvent::OpenRejected, addr);
        request.endpoint().destroy(Some(error));

        if let Some(next) = promoted {
            debug!(addr, "sending queued open request");
            self.send_frame(next.frame().clone());
            self.event(MuxEvent::OpenSent, addr);
        }
    }

    fn process_data(&self, addr: u32, priority: u8, payload: Bytes) {
        let endpoint = lock(&self.open_endpoints).get(&addr).cloned();
        let Some(endpoint) = endpoint else {
            self.destroy(Some(ChannelError::Protocol("No channel was available to take care of the data received".to_string())));
            return;
        };
        if payload.is_empty() {
            self.destroy(Some(ChannelError::Protocol("Zero data frame received".to_string())));
            return;
        }

        endpoint.add_data(EndpointData { priority, content: payload });
    }

    fn process_signal(&self, addr: u32, flag: u8, payload: Bytes) {
        if addr == 0 {
            self.process_broadcast(flag, payload);
            return;
        }

        let endpoint = lock(&self.open_endpoints).get(&addr).cloned();
        let Some(endpoint) = endpoint else {
            self.destroy(Some(ChannelError::Protocol("Received unknown channel".to_string())));
            return;
        };

        if flag == Frame::SIG_EMIT {
            if endpoint.is_closing() {
                trace!(addr, "channel is closing, dropping signal");
            }
            else {
                endpoint.add_signal(EndpointSignal { kind: flag, content: payload });
            }
            return;
        }

        if !endpoint.is_closing() {
            debug!(addr, "server ended the channel, confirming");
            self.send_frame(Frame::end_signal(addr));
        }
        self.remove_open_endpoint(addr, &endpoint);
        endpoint.destroy(signal_error(flag, &payload));
    }

    /// A signal to address 0 goes to all open channels. Anything but an emit with content ends
    ///  the channels, and the connection is destroyed afterwards if they were its last users.
    fn process_broadcast(&self, flag: u8, payload: Bytes) {
        let ending = flag != Frame::SIG_EMIT || payload.is_empty();
        let marked_closing = ending && {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.teardown == Teardown::Active {
                lifecycle.teardown = Teardown::Closing;
                true
            }
            else {
                false
            }
        };

        let endpoints: Vec<(u32, Arc<EndpointShared>)> = lock(&self.open_endpoints)
            .iter()
            .map(|(addr, endpoint)| (*addr, endpoint.clone()))
            .collect();
        debug!("broadcast signal {:x} to {} channels", flag, endpoints.len());

        for (addr, endpoint) in endpoints {
            if flag == Frame::SIG_EMIT {
                endpoint.add_signal(EndpointSignal { kind: flag, content: payload.clone() });
            }
            else {
                self.remove_open_endpoint(addr, &endpoint);
                endpoint.destroy(signal_error(flag, &payload));
            }
        }

        if marked_closing {
            {
                let mut lifecycle = lock(&self.lifecycle);
                if lifecycle.teardown == Teardown::Closing {
                    lifecycle.teardown = Teardown::Active;
                }
            }
            self.check_ref_count();
        }
    }

    /// Destroys the connection and every endpoint using it. This is a no-op if the connection
    ///  is being destroyed already.
    pub(crate) fn destroy(&self, error: Option<ChannelError>) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            match lifecycle.teardown {
                Teardown::Destroying | Teardown::Destroyed => return,
                Teardown::Active | Teardown::Closing => lifecycle.teardown = Teardown::Destroying,
            }
        }

        match &error {
            Some(e) => warn!("destroying connection to {}:{}: {}", self.host, self.port, e),
            None => debug!("destroying connection to {}:{}", self.host, self.port),
        }
        self.teardown(error);
    }

    /// requires `Destroying` to be set by the caller
    fn teardown(&self, error: Option<ChannelError>) {
        let pending: Vec<Arc<OpenRequest>> = lock(&self.pending)
            .drain()
            .map(|(_, r)| r)
            .collect();
        trace!("destroying {} pending open requests", pending.len());
        for request in pending {
            request.endpoint().destroy(error.clone());
        }

        let queued: Vec<Arc<OpenRequest>> = lock(&self.wait_queue)
            .drain()
            .flat_map(|(_, q)| q)
            .collect();
        trace!("destroying {} queued open requests", queued.len());
        for request in queued {
            request.endpoint().destroy(error.clone());
        }

        let open: Vec<Arc<EndpointShared>> = lock(&self.open_endpoints)
            .drain()
            .map(|(_, e)| e)
            .collect();
        trace!("destroying {} open endpoints", open.len());
        for endpoint in open {
            endpoint.destroy(error.clone());
        }

        *lock(&self.outbound) = None;
        self.shutdown.send_replace(true);

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self);
        }

        lock(&self.lifecycle).teardown = Teardown::Destroyed;
        self.event(MuxEvent::ConnectionDestroyed, 0);
    }
}

/// Replaces the pending request for `addr` with the next request from its wait queue, if any.
fn promote_next(pending: &mut FxHashMap<u32, Arc<OpenRequest>>, wait_queue: &mut FxHashMap<u32, VecDeque<Arc<OpenRequest>>>, addr: u32) -> Option<Arc<OpenRequest>> {
    let next = wait_queue.get_mut(&addr).and_then(|q| q.pop_front());
    if wait_queue.get(&addr).is_some_and(|q| q.is_empty()) {
        wait_queue.remove(&addr);
    }

    match &next {
        Some(next) => pending.insert(addr, next.clone()),
        None => pending.remove(&addr),
    };
    next
}

fn signal_error(flag: u8, payload: &[u8]) -> Option<ChannelError> {
    if flag == Frame::SIG_END {
        return None;
    }
    Some(ChannelError::signal(SignalErrorKind::from(flag), &String::from_utf8_lossy(payload)))
}

async fn read_frame(reader: &mut (impl AsyncRead + Unpin)) -> Result<(FrameHeader, Bytes), ChannelError> {
    let mut header_buf = [0u8; Frame::HEADER_LEN];
    reader.read_exact(&mut header_buf).await
        .map_err(|e| {
            debug!("read failed: {}", e);
            ChannelError::Transport("Could not read from the socket".to_string())
        })?;

    let header = FrameHeader::deser(&mut header_buf.as_slice())
        .map_err(|e| ChannelError::Protocol(format!("Received a malformed frame: {}", e)))?;

    let mut payload = vec![0u8; header.payload_len()];
    reader.read_exact(&mut payload).await
        .map_err(|e| {
            debug!("read failed: {}", e);
            ChannelError::Transport("Could not read from the socket".to_string())
        })?;

    Ok((header, Bytes::from(payload)))
}
