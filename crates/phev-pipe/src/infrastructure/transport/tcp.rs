//! TCP transport to the head unit.
//!
//! The head unit runs a Wi-Fi access point and accepts one TCP connection on
//! a fixed port.  Reads use a short socket timeout so the session loop never
//! blocks for long.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::application::transport::{Transport, TransportError};

/// Largest single read.
const READ_BUFFER_SIZE: usize = 1024;

/// Upper bound on the TCP connect handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpTransport {
    host: String,
    port: u16,
    read_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16, read_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            read_timeout,
            stream: None,
        }
    }

    fn resolve(&self) -> Result<SocketAddr, TransportError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::ConnectFailed(format!("{}:{}: {e}", self.host, self.port)))?
            .next()
            .ok_or_else(|| {
                TransportError::ConnectFailed(format!("{}:{}: no address", self.host, self.port))
            })
    }

    fn drop_stream(&mut self, reason: &str) {
        if self.stream.take().is_some() {
            warn!(host = %self.host, port = self.port, reason, "vehicle connection dropped");
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = self.resolve()?;
        debug!(%addr, "connecting to vehicle");

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| TransportError::ConnectFailed(format!("{addr}: {e}")))?;
        // A zero timeout is rejected by the OS; treat it as the smallest poll.
        let timeout = self.read_timeout.max(Duration::from_millis(1));
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::Io(e.to_string()))?;

        info!(%addr, "connected to vehicle");
        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buf = [0u8; READ_BUFFER_SIZE];
        match stream.read(&mut buf) {
            Ok(0) => {
                self.drop_stream("closed by peer");
                Err(TransportError::Closed)
            }
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => {
                self.drop_stream("read error");
                Err(TransportError::Io(e.to_string()))
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        if let Err(e) = stream.write_all(bytes) {
            self.drop_stream("write error");
            return Err(TransportError::Io(e.to_string()));
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!(host = %self.host, port = self.port, "vehicle connection closed");
        }
    }
}
