//! Control service: a line-oriented TCP server in front of the command
//! interpreter. Every reply ends with [`END_MARKER`].

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use parking_lot::Mutex;

use crate::cli;
use crate::error::Error;
use crate::vswitch::Vswitch;
use crate::Result;

pub const END_MARKER: &str = "\0\x01\0\x01\0";

const LISTENER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const CLIENT_TIMEOUT: Duration = Duration::new(10, 0);

/// Longest command line accepted; a client exceeding it is dropped.
pub const MAX_LINE_LEN: usize = 4096;

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::invalid(format!("address '{addr}'")))
}

struct Conn {
    stream: TcpStream,
    peer: SocketAddr,
    input: Vec<u8>,
    output: Vec<u8>,
}

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    conns: HashMap<Token, Conn>,
    next_token: usize,
}

impl Server {
    pub fn bind(addr: &str) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(resolve(addr)?)?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            conns: HashMap::new(),
            next_token: LISTENER.0 + 1,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `stop` is raised.
    pub fn run(&mut self, vs: &Mutex<Vswitch>, stop: &AtomicBool) -> Result<()> {
        let mut events = Events::with_capacity(32);

        log::info!("control service listening on {}", self.local_addr()?);

        while !stop.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                let token = event.token();
                if token == LISTENER {
                    self.accept()?;
                    continue;
                }

                let Some(conn) = self.conns.get_mut(&token) else {
                    continue;
                };
                let keep = match serve(conn, self.poll.registry(), token, vs, event.is_readable()) {
                    Ok(keep) => keep,
                    Err(e) => {
                        log::error!("control connection {} error {}", conn.peer, e);
                        false
                    }
                };

                if !keep {
                    if let Some(mut conn) = self.conns.remove(&token) {
                        let _ = self.poll.registry().deregister(&mut conn.stream);
                        log::debug!("control connection {} closed", conn.peer);
                    }
                }
            }
        }

        log::debug!("control service exiting...");

        Ok(())
    }

    fn accept(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    log::debug!("control connection from {}", peer);

                    self.conns.insert(
                        token,
                        Conn {
                            stream,
                            peer,
                            input: Vec::new(),
                            output: Vec::new(),
                        },
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Read what is available, run complete lines and flush replies. Returns
/// false once the connection should be closed.
fn serve(
    conn: &mut Conn,
    registry: &Registry,
    token: Token,
    vs: &Mutex<Vswitch>,
    readable: bool,
) -> io::Result<bool> {
    let mut keep = true;

    if readable {
        let mut buf = [0u8; 512];
        loop {
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    keep = false;
                    break;
                }
                Ok(n) => {
                    conn.input.extend_from_slice(&buf[..n]);
                    if conn.input.len() > 4 * MAX_LINE_LEN {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        while let Some(pos) = conn.input.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = conn.input.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();

            if matches!(line, "quit" | "exit") {
                return Ok(false);
            }

            if !line.is_empty() && !line.starts_with('#') {
                log::debug!("{}: {}", conn.peer, line);
                let (Ok(out) | Err(out)) = cli::execute_line(&mut vs.lock(), line);
                conn.output.extend_from_slice(out.as_bytes());
            }
            conn.output.extend_from_slice(END_MARKER.as_bytes());
        }

        if conn.input.len() > MAX_LINE_LEN {
            log::warn!(
                "control connection {}: line longer than {} bytes, closing",
                conn.peer,
                MAX_LINE_LEN
            );
            return Ok(false);
        }
    }

    while !conn.output.is_empty() {
        match conn.stream.write(&conn.output) {
            Ok(0) => return Ok(false),
            Ok(n) => {
                conn.output.drain(..n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    if keep {
        let interest = if conn.output.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        registry.reregister(&mut conn.stream, token, interest)?;
    }

    Ok(keep)
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(END_MARKER.len())
        .position(|w| w == END_MARKER.as_bytes())
}

/// Send one command line and wait for its reply. Blocks.
pub fn send_command(addr: &str, line: &str) -> Result<String> {
    let mut stream = std::net::TcpStream::connect(resolve(addr)?)?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;

    stream.write_all(line.trim_end().as_bytes())?;
    stream.write_all(b"\n")?;

    let mut reply = Vec::new();
    let mut buf = [0u8; 512];
    let end = loop {
        if let Some(end) = find_marker(&reply) {
            break end;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before end of reply",
            )));
        }
        reply.extend_from_slice(&buf[..n]);
    };
    reply.truncate(end);

    log::debug!("reply {} bytes", reply.len());

    Ok(String::from_utf8_lossy(&reply).into_owned())
}
