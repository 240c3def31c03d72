use std::fmt::{Display, Formatter};
use std::str::FromStr;

use bytes::Bytes;

use crate::config::MuxConfig;
use crate::error::ChannelError;

/// The destination of a channel: which server (`host`, `port`), which channel on that server
///  (`address`) and an optional token that is passed to the server with the OPEN request.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct EndpointAddr {
    pub host: String,
    pub port: u16,
    pub address: u32,
    pub token: Option<Bytes>,
}

impl EndpointAddr {
    pub fn new(host: impl Into<String>, port: u16, address: u32) -> EndpointAddr {
        EndpointAddr {
            host: host.into(),
            port,
            address,
            token: None,
        }
    }

    pub fn with_token(self, token: impl Into<Bytes>) -> EndpointAddr {
        EndpointAddr {
            token: Some(token.into()),
            ..self
        }
    }

    /// Parses `host[:port][/address | /xHEXADDRESS][?token]`, falling back to the configured
    ///  defaults for port and address. The parts are split off from the end of the string,
    ///  so a query may contain `/` or `:`.
    pub fn parse(expr: &str, config: &MuxConfig) -> Result<EndpointAddr, ChannelError> {
        Self::parse_with_defaults(expr, config.default_port, config.default_address)
    }

    fn parse_with_defaults(expr: &str, default_port: u16, default_address: u32) -> Result<EndpointAddr, ChannelError> {
        let (rest, token) = match expr.rsplit_once('?') {
            Some((rest, query)) if !query.is_empty() => (rest, Some(Bytes::copy_from_slice(query.as_bytes()))),
            Some((rest, _)) => (rest, None),
            None => (expr, None),
        };

        let (rest, address) = if let Some((rest, hex)) = rest.rsplit_once("/x") {
            let address = u32::from_str_radix(hex, 16)
                .map_err(|_| ChannelError::InvalidAddress(hex.to_string()))?;
            (rest, address)
        }
        else if let Some((rest, dec)) = rest.rsplit_once('/') {
            let address = dec.parse::<u32>()
                .map_err(|_| ChannelError::InvalidAddress(dec.to_string()))?;
            (rest, address)
        }
        else {
            (rest, default_address)
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>()
                    .map_err(|_| ChannelError::InvalidPort(port.to_string()))?;
                (host, port)
            }
            None => (rest, default_port),
        };

        Ok(EndpointAddr {
            host: host.to_string(),
            port,
            address,
            token,
        })
    }
}

impl FromStr for EndpointAddr {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_defaults(s, MuxConfig::DEFAULT_PORT, MuxConfig::DEFAULT_ADDRESS)
    }
}

impl Display for EndpointAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/x{:x}", self.host, self.port, self.address)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::host_only("localhost", "localhost", 7010, 1, None)]
    #[case::port("localhost:8080", "localhost", 8080, 1, None)]
    #[case::decimal("example.com/5", "example.com", 7010, 5, None)]
    #[case::hex("example.com/x1f", "example.com", 7010, 0x1f, None)]
    #[case::hex_upper("example.com/xFFFFFFFF", "example.com", 7010, 0xffff_ffff, None)]
    #[case::all("example.com:7120/x10?secret", "example.com", 7120, 16, Some("secret"))]
    #[case::empty_query("example.com:7120/3?", "example.com", 7120, 3, None)]
    #[case::query_with_separators("h/2?a/b:c", "h", 7010, 2, Some("a/b:c"))]
    #[case::zero("h:1/0", "h", 1, 0, None)]
    fn test_from_str(#[case] expr: &str, #[case] host: &str, #[case] port: u16, #[case] address: u32, #[case] token: Option<&str>) {
        let addr = EndpointAddr::from_str(expr).unwrap();
        assert_eq!(addr.host, host);
        assert_eq!(addr.port, port);
        assert_eq!(addr.address, address);
        assert_eq!(addr.token.as_deref(), token.map(|t| t.as_bytes()));
    }

    #[rstest]
    #[case::bad_decimal("h/abc", ChannelError::InvalidAddress("abc".to_string()))]
    #[case::bad_hex("h/xzz", ChannelError::InvalidAddress("zz".to_string()))]
    #[case::negative("h/-1", ChannelError::InvalidAddress("-1".to_string()))]
    #[case::address_overflow("h/4294967296", ChannelError::InvalidAddress("4294967296".to_string()))]
    #[case::bad_port("h:port/1", ChannelError::InvalidPort("port".to_string()))]
    #[case::port_overflow("h:70000", ChannelError::InvalidPort("70000".to_string()))]
    fn test_from_str_invalid(#[case] expr: &str, #[case] expected: ChannelError) {
        assert_eq!(EndpointAddr::from_str(expr), Err(expected));
    }

    #[test]
    fn test_parse_with_config_defaults() {
        let config = MuxConfig {
            default_port: 9000,
            default_address: 42,
            ..MuxConfig::default()
        };
        let addr = EndpointAddr::parse("somewhere", &config).unwrap();
        assert_eq!(addr, EndpointAddr::new("somewhere", 9000, 42));
    }

    #[test]
    fn test_display() {
        let addr = EndpointAddr::new("h", 7010, 255).with_token(b"t".as_slice());
        assert_eq!(addr.to_string(), "h:7010/xff");
    }
}
