use tracing::debug;

#[cfg(test)] use mockall::automock;

/// Points in a channel's or connection's life that are reported to a [MuxEventListener].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MuxEvent {
    /// a TCP connection to the destination is being established
    Connecting,
    /// the server accepted the handshake, queued OPEN requests are being flushed
    Handshaked,
    /// an OPEN request waits behind another request for the same address
    OpenQueued,
    OpenSent,
    Opened,
    /// the server resolved an OPEN request to a different address
    Redirected,
    OpenRejected,
    EndpointDestroyed,
    ConnectionDestroyed,
}

/// Observer for [MuxEvent]s, e.g. for application-level logging or metrics.
///
/// Listeners are called synchronously from whatever task triggered the event, sometimes while
///  the connection's reader task waits for them. They must return quickly and must not call
///  back into the channel or connection that reported the event.
#[cfg_attr(test, automock)]
pub trait MuxEventListener: Send + Sync {
    fn on_event(&self, event: MuxEvent, addr: u32);
}

/// The default listener: writes every event to the `tracing` log at debug level
pub struct TracingEventListener;

impl MuxEventListener for TracingEventListener {
    fn on_event(&self, event: MuxEvent, addr: u32) {
        debug!(addr, "{:?}", event);
    }
}
