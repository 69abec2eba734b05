//! Listen/accept/read/write seam over the client connection.
//!
//! One listener, at most one accepted client. Everything is non-blocking so
//! the single event loop can interleave socket reads with the debug-event
//! pump. The trait exists so server tests can drive the packet path from
//! scripted bytes.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};

use anyhow::{Context, Result};
use log::{info, warn};

pub trait Transport {
    /// Accepts a pending connection, if one is waiting. Only one client at a
    /// time; a second connection attempt stays in the backlog.
    fn accept(&mut self) -> bool;

    fn is_connected(&self) -> bool;

    /// Non-blocking read; returns the number of bytes placed in `buf`, zero
    /// when nothing is pending. A closed or broken peer drops the
    /// connection.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    fn write_all(&mut self, data: &[u8]);

    fn close(&mut self);
}

pub struct TcpTransport {
    listener: TcpListener,
    client: Option<TcpStream>,
}

impl TcpTransport {
    pub fn listen(port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .with_context(|| format!("binding 127.0.0.1:{port}"))?;
        listener
            .set_nonblocking(true)
            .context("making listener non-blocking")?;
        info!("listening on port {port}");
        Ok(TcpTransport {
            listener,
            client: None,
        })
    }

    fn drop_client(&mut self) {
        self.client = None;
    }
}

impl Transport for TcpTransport {
    fn accept(&mut self) -> bool {
        if self.client.is_some() {
            return false;
        }
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(true).is_err() {
                    return false;
                }
                let _ = stream.set_nodelay(true);
                info!("debugger connected from {peer}");
                self.client = Some(stream);
                true
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => false,
            Err(err) => {
                warn!("accept failed: {err}");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let Some(client) = self.client.as_mut() else {
            return 0;
        };
        match client.read(buf) {
            Ok(0) => {
                self.drop_client();
                0
            }
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => 0,
            Err(err) => {
                warn!("client read failed: {err}");
                self.drop_client();
                0
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        // The replies are tiny; a full send buffer means the client is gone
        // for our purposes.
        if let Err(err) = client.write_all(data) {
            warn!("client write failed: {err}");
            self.drop_client();
        }
    }

    fn close(&mut self) {
        self.drop_client();
    }
}

/// Scripted transport for server tests: bytes in, bytes out, no sockets.
#[cfg(test)]
#[derive(Default)]
pub struct MockTransport {
    pub connected: bool,
    pub pending_accept: bool,
    pub input: std::collections::VecDeque<u8>,
    pub output: Vec<u8>,
}

#[cfg(test)]
impl MockTransport {
    pub fn push_input(&mut self, data: &[u8]) {
        self.input.extend(data.iter().copied());
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn accept(&mut self) -> bool {
        if self.connected || !self.pending_accept {
            return false;
        }
        self.pending_accept = false;
        self.connected = true;
        true
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.input.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn write_all(&mut self, data: &[u8]) {
        if self.connected {
            self.output.extend_from_slice(data);
        }
    }

    fn close(&mut self) {
        self.connected = false;
    }
}
