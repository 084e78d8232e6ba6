use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{RelayError, RelayResult};

/**
    Byte stream a session runs over.

    Implemented for `TcpStream`; in-memory streams used in tests only need
    `Read + Write` and can keep the default no-op shutdown.
*/
pub trait Transport: Read + Write {
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/**
    Resolve `host:port`, returning the first address.
*/
pub fn resolve(host: &str, port: u16) -> RelayResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| RelayError::Io(format!("resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| RelayError::Io(format!("resolve {host}:{port}: no addresses")))
}

/**
    Open a TCP connection, giving up after `timeout`.

    Every resolved address is tried in turn; the error of the last attempt is
    reported. The returned stream is in blocking mode.
*/
pub fn connect(host: &str, port: u16, timeout: Duration) -> RelayResult<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| RelayError::Io(format!("resolve {host}:{port}: {e}")))?;

    let mut last = RelayError::Io(format!("resolve {host}:{port}: no addresses"));
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                tracing::debug!(%addr, "connected");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect failed");
                last = connect_error(e);
            }
        }
    }
    Err(last)
}

fn connect_error(e: io::Error) -> RelayError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => RelayError::ConnectTimeout,
        _ => RelayError::from(e),
    }
}
