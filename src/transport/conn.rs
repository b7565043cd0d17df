//! An accepted connection, plain or TLS, with deadline-bounded reads.
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use super::TransportError;

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            Stream::Tls(s) => &s.sock,
        }
    }
}

/// A connection handed to a [`ConnectionHandler`](super::ConnectionHandler).
///
/// Dropping it closes the socket (sending a TLS close_notify first).
pub struct Connection {
    stream: Stream,
    peer: SocketAddr,
    io_timeout: Duration,
}

impl Connection {
    /// Wrap an accepted socket without encryption.
    pub fn plain(tcp: TcpStream, io_timeout: Duration) -> io::Result<Self> {
        let peer = tcp.peer_addr()?;
        tcp.set_nodelay(true)?;
        tcp.set_write_timeout(Some(io_timeout))?;
        Ok(Self {
            stream: Stream::Plain(tcp),
            peer,
            io_timeout,
        })
    }

    /// Run the server side of a TLS handshake on an accepted socket.
    pub(crate) fn tls(
        tcp: TcpStream,
        config: Arc<ServerConfig>,
        io_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let peer = tcp.peer_addr()?;
        tcp.set_nodelay(true)?;
        tcp.set_write_timeout(Some(io_timeout))?;
        tcp.set_read_timeout(Some(io_timeout))?;

        let handshake_failed = |reason: String| TransportError::Handshake { peer, reason };
        let conn = ServerConnection::new(config).map_err(|e| handshake_failed(e.to_string()))?;
        let mut stream = StreamOwned::new(conn, tcp);
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(|e| handshake_failed(e.to_string()))?;
        }
        debug!(
            "TLS session with {} established ({:?})",
            peer,
            stream.conn.protocol_version()
        );
        Ok(Self {
            stream: Stream::Tls(Box::new(stream)),
            peer,
            io_timeout,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    /// Write the whole frame and flush it.
    pub fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)?;
        self.flush()
    }

    /// Read until `len` bytes arrived, the peer closed, or `timeout` elapsed.
    ///
    /// The deadline covers the whole call, not each read. A close by the
    /// peer ends the loop early and returns what was received so far, so
    /// callers must check the length.
    pub fn read_up_to(&mut self, len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; len];
        let mut got = 0;
        while got < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline elapsed"));
            }
            self.stream.tcp().set_read_timeout(Some(remaining))?;
            match self.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, e));
                }
                Err(e) => return Err(e),
            }
        }
        buf.truncate(got);
        Ok(buf)
    }

    /// Like [`read_up_to`](Self::read_up_to) but a short read is an
    /// `UnexpectedEof` error.
    pub fn read_exact_within(&mut self, len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        let bytes = self.read_up_to(len, timeout)?;
        if bytes.len() < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("peer closed after {} of {} bytes", bytes.len(), len),
            ));
        }
        Ok(bytes)
    }

    /// Read a single status byte. `None` means the peer closed.
    pub fn read_byte(&mut self, timeout: Duration) -> io::Result<Option<u8>> {
        Ok(self.read_up_to(1, timeout)?.first().copied())
    }
}

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stream {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stream {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Stream::Tls(s) = &mut self.stream {
            s.conn.send_close_notify();
            while s.conn.wants_write() {
                if s.conn.write_tls(&mut s.sock).is_err() {
                    break;
                }
            }
        }
        let _ = self.stream.tcp().shutdown(Shutdown::Both);
        debug!("closed connection to {}", self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn pair(io_timeout: Duration) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Connection::plain(server, io_timeout).unwrap(), client)
    }

    #[test]
    fn read_up_to_joins_partial_writes() {
        let (mut conn, mut client) = pair(Duration::from_secs(2));
        let writer = thread::spawn(move || {
            client.write_all(b"Keep").unwrap();
            thread::sleep(Duration::from_millis(50));
            client.write_all(b"-Alive").unwrap();
            client
        });
        let got = conn.read_up_to(10, Duration::from_secs(2)).unwrap();
        assert_eq!(got, b"Keep-Alive");
        drop(writer.join().unwrap());
    }

    #[test]
    fn peer_close_returns_short_read() {
        let (mut conn, mut client) = pair(Duration::from_secs(2));
        client.write_all(&[0x01, 0x02]).unwrap();
        drop(client);
        let got = conn.read_up_to(6, Duration::from_secs(2)).unwrap();
        assert_eq!(got, vec![0x01, 0x02]);
        let err = conn.read_exact_within(1, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn silence_times_out_with_cumulative_deadline() {
        let (mut conn, _client) = pair(Duration::from_secs(2));
        let started = Instant::now();
        let err = conn.read_byte(Duration::from_millis(150)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
