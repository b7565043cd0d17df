#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use beacon_server::codec::beacon::BEACON_HEADER_LEN;
use beacon_server::codec::{ACK, NUL, TXG};
use beacon_server::link::LinkConfig;
use beacon_server::transport::ListenConfig;

pub const IO_TIMEOUT: Duration = Duration::from_millis(300);

pub fn link_config(name: &str) -> LinkConfig {
    LinkConfig {
        name: name.to_string(),
        io_timeout: IO_TIMEOUT,
        keepalive_interval: Duration::from_secs(30),
        repeat_attempts: 3,
        connect_wait: Duration::from_secs(3),
    }
}

pub fn loopback(name: &str) -> ListenConfig {
    let mut listen = ListenConfig::new(name, "127.0.0.1", 0);
    listen.io_timeout = IO_TIMEOUT;
    listen
}

pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

/// The hardware end of a link.
pub struct Peer {
    stream: TcpStream,
}

impl Peer {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Self { stream }
    }

    pub fn read(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).unwrap();
        buf
    }

    /// Read one beacon frame using its length field.
    pub fn read_beacon_frame(&mut self) -> Vec<u8> {
        let mut frame = self.read(BEACON_HEADER_LEN);
        let len = usize::from(u16::from_be_bytes([frame[3], frame[4]]));
        frame.extend(self.read(len + 1));
        frame
    }

    /// Answer a beacon frame the way the hardware does once it has
    /// transmitted `packets` packets.
    pub fn complete_beacon(&mut self, frame: &[u8], packets: usize) {
        let len = usize::from(u16::from_be_bytes([frame[3], frame[4]]));
        let mut reply = vec![ACK];
        reply.extend(std::iter::repeat(TXG).take(packets));
        reply.extend_from_slice(&[ACK, (len % 255) as u8, NUL]);
        self.send(&reply);
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
        self.stream.flush().unwrap();
    }

    /// Whether anything else arrives within `wait`.
    pub fn is_quiet_for(&mut self, wait: Duration) -> bool {
        self.stream.set_read_timeout(Some(wait)).unwrap();
        let mut buf = [0u8; 64];
        let quiet = !matches!(self.stream.read(&mut buf), Ok(n) if n > 0);
        self.stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        quiet
    }
}
