//! TCP roles of the detection session.
//!
//! The server side is async (it shares the detection loop's runtime); the
//! client side blocks, because it is called from the mission controller's
//! single coordination thread. Both speak the drop-proto framed wire
//! format, one message per session.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::info;

use drop_mission::{MissionError, TargetSource};
use drop_proto::framing::{self, FrameError};
use drop_proto::TargetMessage;

pub struct TargetServer {
    listener: TcpListener,
}

impl TargetServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind detection server on {addr}"))?;
        info!("detection server listening on {}", addr);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// One client at a time; callers accept the next only after the
    /// current session ends.
    pub async fn accept(&self) -> Result<TargetSession> {
        let (stream, peer) = self.listener.accept().await.context("accept client")?;
        info!("ground station connected: {}", peer);
        Ok(TargetSession { stream, peer })
    }
}

/// One accepted connection. Sending consumes the session: a session
/// carries exactly one target, then the stream closes.
pub struct TargetSession {
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
}

impl TargetSession {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send_target(mut self, msg: &TargetMessage) -> Result<()> {
        let frame = framing::encode_frame(msg).context("encode target frame")?;
        self.stream.write_all(&frame).await.context("send target frame")?;
        self.stream.flush().await?;
        self.stream.shutdown().await.ok();
        info!("target sent to {} ({} bytes)", self.peer, frame.len());
        Ok(())
    }
}

/// Blocking client role used by the mission controller. Every wait is
/// bounded: the connect and the single read both carry timeouts.
pub struct TcpTargetClient {
    addr: String,
    connect_timeout: Duration,
    stream: Option<StdTcpStream>,
}

impl TcpTargetClient {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self { addr: addr.into(), connect_timeout, stream: None }
    }
}

impl TargetSource for TcpTargetClient {
    fn connect(&mut self) -> Result<(), MissionError> {
        let addr = self
            .addr
            .to_socket_addrs()
            .map_err(|e| MissionError::Connection(format!("resolve {}: {e}", self.addr)))?
            .next()
            .ok_or_else(|| MissionError::Connection(format!("no address for {}", self.addr)))?;

        let stream = StdTcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| MissionError::Connection(format!("connect {}: {e}", self.addr)))?;
        info!("connected to detection server at {}", self.addr);
        self.stream = Some(stream);
        Ok(())
    }

    fn recv_target(&mut self, timeout: Duration) -> Result<TargetMessage, MissionError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MissionError::Connection("not connected".into()))?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| MissionError::Connection(e.to_string()))?;

        match framing::read_frame(stream) {
            Ok(msg) => Ok(msg),
            Err(FrameError::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Err(MissionError::TargetTimeout(timeout.as_secs()))
            }
            Err(e) => Err(MissionError::Connection(e.to_string())),
        }
    }

    fn close(&mut self) {
        if let Some(s) = self.stream.take() {
            let _ = s.shutdown(Shutdown::Both);
        }
    }
}
