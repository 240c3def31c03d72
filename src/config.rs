use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::bail;

use crate::events::{MuxEventListener, TracingEventListener};

pub struct MuxConfig {
    /// The first four bytes of the handshake in both directions. The server's response must
    ///  start with the same bytes, otherwise the connection is discarded.
    pub handshake_magic: [u8; 4],

    /// port used when an address string does not contain one
    pub default_port: u16,
    /// channel address used when an address string does not contain one
    pub default_address: u32,

    /// Disables Nagle's algorithm on connection sockets. Frames are typically small and
    ///  latency sensitive, so this is on by default. If the OS refuses, the connection is
    ///  used anyway and a warning is logged.
    pub tcp_nodelay: bool,

    pub event_listener: Arc<dyn MuxEventListener>,
}

impl MuxConfig {
    pub const DEFAULT_MAGIC: [u8; 4] = *b"DNA1";
    pub const DEFAULT_PORT: u16 = 7010;
    pub const DEFAULT_ADDRESS: u32 = 1;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.handshake_magic == [0; 4] {
            bail!("Handshake magic must not be all zeros");
        }
        if self.default_port == 0 {
            bail!("Default port must not be 0");
        }

        Ok(())
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            handshake_magic: Self::DEFAULT_MAGIC,
            default_port: Self::DEFAULT_PORT,
            default_address: Self::DEFAULT_ADDRESS,
            tcp_nodelay: true,
            event_listener: Arc::new(TracingEventListener),
        }
    }
}

impl Debug for MuxConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConfig")
            .field("handshake_magic", &String::from_utf8_lossy(&self.handshake_magic))
            .field("default_port", &self.default_port)
            .field("default_address", &self.default_address)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::default(MuxConfig::default(), true)]
    #[case::custom_magic(MuxConfig { handshake_magic: *b"XYZ1", ..MuxConfig::default() }, true)]
    #[case::zero_magic(MuxConfig { handshake_magic: [0; 4], ..MuxConfig::default() }, false)]
    #[case::zero_port(MuxConfig { default_port: 0, ..MuxConfig::default() }, false)]
    fn test_validate(#[case] config: MuxConfig, #[case] expected_ok: bool) {
        assert_eq!(config.validate().is_ok(), expected_ok);
    }

    #[test]
    fn test_debug() {
        let s = format!("{:?}", MuxConfig::default());
        assert!(s.contains("DNA1"));
        assert!(s.contains("7010"));
    }
}
