//! A scripted stand-in for a server, for testing code that uses channels without a real server.
//!
//! Each [FakePeer] is one accepted TCP connection that the test drives step by step: read the
//!  handshake, answer it, read the frames the client sends and send frames back.

use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::addr::EndpointAddr;
use crate::config::MuxConfig;
use crate::frame::{Frame, OpCode};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FakeServer {
    listener: TcpListener,
}

impl FakeServer {
    /// Listens on an ephemeral port on the loopback interface
    pub async fn start() -> anyhow::Result<FakeServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(FakeServer { listener })
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr()
            .map(|a| a.port())
            .unwrap_or_default()
    }

    pub fn endpoint_addr(&self, address: u32) -> EndpointAddr {
        EndpointAddr::new("127.0.0.1", self.port(), address)
    }

    pub async fn accept(&self) -> anyhow::Result<FakePeer> {
        let (stream, _) = timeout(STEP_TIMEOUT, self.listener.accept()).await??;
        Ok(FakePeer { stream })
    }

    /// accepts a connection and answers its handshake with success
    pub async fn accept_handshaked(&self) -> anyhow::Result<FakePeer> {
        let mut peer = self.accept().await?;
        let (magic, _) = peer.read_handshake().await?;
        peer.send_handshake_response(magic, 0).await?;
        Ok(peer)
    }
}

pub struct FakePeer {
    stream: TcpStream,
}

impl FakePeer {
    /// returns the magic and host name sent by the client
    pub async fn read_handshake(&mut self) -> anyhow::Result<([u8; 4], String)> {
        let mut magic = [0u8; 4];
        timeout(STEP_TIMEOUT, self.stream.read_exact(&mut magic)).await??;
        let len = timeout(STEP_TIMEOUT, self.stream.read_u8()).await??;
        let mut host = vec![0u8; len as usize];
        timeout(STEP_TIMEOUT, self.stream.read_exact(&mut host)).await??;
        Ok((magic, String::from_utf8(host)?))
    }

    pub async fn send_handshake_response(&mut self, magic: [u8; 4], status: u8) -> anyhow::Result<()> {
        let mut buf = magic.to_vec();
        buf.push(status);
        self.send_raw(&buf).await
    }

    pub async fn read_frame(&mut self) -> anyhow::Result<Frame> {
        let mut header = [0u8; Frame::HEADER_LEN];
        timeout(STEP_TIMEOUT, self.stream.read_exact(&mut header)).await??;
        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        if len < Frame::HEADER_LEN {
            bail!("client sent a frame with length {}", len);
        }

        let mut buf = BytesMut::from(header.as_slice());
        buf.resize(len, 0);
        timeout(STEP_TIMEOUT, self.stream.read_exact(&mut buf[Frame::HEADER_LEN..])).await??;
        Frame::deser(&mut buf.freeze())
    }

    /// Reads an OPEN request for `address` and confirms it. Returns the request.
    pub async fn accept_open(&mut self, address: u32) -> anyhow::Result<Frame> {
        let open = self.read_frame().await?;
        if open.op() != OpCode::Open || open.addr() != address {
            bail!("expected OPEN request for {}, was {:?}", address, open);
        }
        self.send_frame(&Frame::new(address, OpCode::Open, Frame::OPEN_SUCCESS, Bytes::new())?).await?;
        Ok(open)
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.send_raw(&frame.to_bytes()).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// succeeds if the client sends nothing for `duration`
    pub async fn expect_silence(&mut self, duration: Duration) -> anyhow::Result<()> {
        let mut buf = [0u8; 1];
        match timeout(duration, self.stream.read(&mut buf)).await {
            Err(_) => Ok(()),
            Ok(Ok(0)) => bail!("connection was closed"),
            Ok(Ok(_)) => bail!("client sent data"),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// succeeds if the client closes the connection without sending anything else
    pub async fn expect_closed(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; 1];
        match timeout(STEP_TIMEOUT, self.stream.read(&mut buf)).await? {
            Ok(0) => Ok(()),
            Ok(_) => Err(anyhow!("client sent data instead of closing the connection")),
            // a reset counts as closed
            Err(_) => Ok(()),
        }
    }
}

/// the default handshake magic, for answering handshakes by hand
pub const MAGIC: [u8; 4] = MuxConfig::DEFAULT_MAGIC;

/// Polls `condition` until it holds, giving up after a few seconds. Returns whether it held.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
