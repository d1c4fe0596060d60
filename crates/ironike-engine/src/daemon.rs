//! Daemon event loop.
//!
//! Single-threaded, poll-based: one loop dispatches ISAKMP datagrams,
//! control-socket lines, kernel replies, and timer firings, one event
//! at a time, to completion. Nothing here blocks; the poll timeout is
//! clamped to the scheduler's next deadline.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::control::{self, ControlCommand};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

/// Maximum ISAKMP datagram we accept.
const MAX_UDP_SIZE: usize = 65535;

/// Poll timeout ceiling in milliseconds.
const TIMER_TICK_MS: i32 = 250;

/// How many datagrams to drain per readiness event.
const DRAIN_BATCH: usize = 64;

struct ControlConn {
    stream: TcpStream,
    peer: SocketAddr,
    buf: Vec<u8>,
}

pub struct Daemon {
    engine: Engine,
    socket: Option<UdpSocket>,
    control_listener: Option<TcpListener>,
    control_conns: Vec<ControlConn>,
    shutdown: Arc<AtomicBool>,
}

impl Daemon {
    pub fn new(engine: Engine) -> Self {
        Daemon {
            engine,
            socket: None,
            control_listener: None,
            control_conns: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shutdown flag, for signal handler wiring.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Bind the ISAKMP socket and the control listener.
    pub fn init(&mut self) -> EngineResult<()> {
        let listen = self.engine.local_addr();
        let socket = Self::create_udp_socket(listen)?;
        info!(%listen, "ISAKMP socket bound");
        self.socket = Some(socket);

        let control = TcpListener::bind(self.control_addr())?;
        control.set_nonblocking(true)?;
        info!(control = %self.control_addr(), "control socket listening");
        self.control_listener = Some(control);
        Ok(())
    }

    fn control_addr(&self) -> SocketAddr {
        self.engine.control_addr()
    }

    fn create_udp_socket(listen: SocketAddr) -> EngineResult<UdpSocket> {
        let domain = if listen.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&listen.into())?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    /// Run until the shutdown flag is raised.
    pub fn run(&mut self) -> EngineResult<()> {
        if self.socket.is_none() || self.control_listener.is_none() {
            return Err(EngineError::Config("daemon not initialized".into()));
        }
        #[cfg(unix)]
        {
            self.run_poll_loop()
        }
        #[cfg(not(unix))]
        {
            self.run_sleep_loop()
        }
    }

    fn poll_timeout(&mut self, now: Instant) -> i32 {
        match self.engine.next_deadline() {
            Some(deadline) => {
                let until = deadline.saturating_duration_since(now);
                (until.as_millis() as i32).clamp(0, TIMER_TICK_MS)
            }
            None => TIMER_TICK_MS,
        }
    }

    #[cfg(unix)]
    fn run_poll_loop(&mut self) -> EngineResult<()> {
        use std::os::unix::io::AsRawFd;

        info!("event loop running (poll-based)");
        let mut udp_buf = vec![0u8; MAX_UDP_SIZE];

        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            let timeout = self.poll_timeout(now);

            let udp_fd = self.socket.as_ref().expect("checked in run").as_raw_fd();
            let listener_fd = self
                .control_listener
                .as_ref()
                .expect("checked in run")
                .as_raw_fd();

            let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(2 + self.control_conns.len());
            pollfds.push(libc::pollfd {
                fd: udp_fd,
                events: libc::POLLIN,
                revents: 0,
            });
            pollfds.push(libc::pollfd {
                fd: listener_fd,
                events: libc::POLLIN,
                revents: 0,
            });
            for conn in &self.control_conns {
                pollfds.push(libc::pollfd {
                    fd: conn.stream.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as _, timeout) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %err, "poll failed");
                continue;
            }

            let now = Instant::now();
            self.engine.tick(now);

            if pollfds[0].revents & libc::POLLIN != 0 {
                self.drain_udp(&mut udp_buf, now);
            }
            if pollfds[1].revents & libc::POLLIN != 0 {
                self.accept_controllers();
            }
            let conn_ready: Vec<bool> = pollfds[2..]
                .iter()
                .map(|p| p.revents & (libc::POLLIN | libc::POLLHUP) != 0)
                .collect();
            self.service_controllers(&conn_ready, now);

            self.flush(now);
        }

        info!("shutting down");
        let now = Instant::now();
        self.engine.shutdown(now);
        self.flush(now);
        Ok(())
    }

    #[cfg(not(unix))]
    fn run_sleep_loop(&mut self) -> EngineResult<()> {
        info!("event loop running (sleep fallback)");
        let mut udp_buf = vec![0u8; MAX_UDP_SIZE];
        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            self.engine.tick(now);
            self.drain_udp(&mut udp_buf, now);
            self.accept_controllers();
            let ready = vec![true; self.control_conns.len()];
            self.service_controllers(&ready, now);
            self.flush(now);
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let now = Instant::now();
        self.engine.shutdown(now);
        self.flush(now);
        Ok(())
    }

    fn drain_udp(&mut self, buf: &mut [u8], now: Instant) {
        let local = self.engine.local_addr();
        for _ in 0..DRAIN_BATCH {
            let (n, src) = {
                let socket = self.socket.as_ref().expect("socket bound");
                match socket.recv_from(buf) {
                    Ok(pair) => pair,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!(error = %e, "UDP read failed");
                        break;
                    }
                }
            };
            self.engine.handle_datagram(local, src, &buf[..n], now);
        }
    }

    fn accept_controllers(&mut self) {
        let listener = match &self.control_listener {
            Some(l) => l,
            None => return,
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    info!(%peer, "controller connected");
                    self.control_conns.push(ControlConn {
                        stream,
                        peer,
                        buf: Vec::new(),
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    break;
                }
            }
        }
    }

    /// Read and dispatch complete NDJSON lines from ready controllers.
    fn service_controllers(&mut self, ready: &[bool], now: Instant) {
        let mut commands: Vec<ControlCommand> = Vec::new();
        let mut closed: Vec<usize> = Vec::new();

        for (i, conn) in self.control_conns.iter_mut().enumerate() {
            if !ready.get(i).copied().unwrap_or(false) {
                continue;
            }
            let mut chunk = [0u8; 4096];
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed.push(i);
                        break;
                    }
                    Ok(n) => conn.buf.extend_from_slice(&chunk[..n]),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(peer = %conn.peer, error = %e, "controller read failed");
                        closed.push(i);
                        break;
                    }
                }
            }
            while let Some(pos) = conn.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = conn.buf.drain(..=pos).collect();
                match std::str::from_utf8(&line)
                    .map_err(|_| ())
                    .and_then(|s| control::decode_line::<ControlCommand>(s).map_err(|_| ()))
                {
                    Ok(cmd) => commands.push(cmd),
                    Err(()) => debug!(peer = %conn.peer, "undecodable control line"),
                }
            }
        }

        for i in closed.into_iter().rev() {
            let conn = self.control_conns.remove(i);
            info!(peer = %conn.peer, "controller disconnected");
        }
        for cmd in commands {
            self.engine.handle_control(cmd, now);
        }
    }

    /// Push queued datagrams and notifications out.
    fn flush(&mut self, _now: Instant) {
        for (remote, msg) in self.engine.drain_outbox() {
            if let Some(socket) = &self.socket {
                if let Err(e) = socket.send_to(&msg.to_bytes(), remote) {
                    debug!(%remote, error = %e, "send failed");
                }
            }
        }
        let notifications = self.engine.drain_notifications();
        if notifications.is_empty() {
            return;
        }
        let mut broken: Vec<usize> = Vec::new();
        for notify in &notifications {
            let line = control::encode_line(notify);
            for (i, conn) in self.control_conns.iter_mut().enumerate() {
                if conn.stream.write_all(line.as_bytes()).is_err() {
                    broken.push(i);
                }
            }
        }
        broken.sort_unstable();
        broken.dedup();
        for i in broken.into_iter().rev() {
            let conn = self.control_conns.remove(i);
            debug!(peer = %conn.peer, "controller write failed, dropping");
        }
    }
}
