//! The per-transfer state machines.
//!
//! A [`WriteSession`] receives a file (we send ACKs), a [`ReadSession`]
//! sends one (we send DATA). Each starts in a bootstrap pre-state selected
//! by its origin: remote-origin sessions answer a request the dispatcher
//! accepted, local-origin sessions follow a request this endpoint sent and
//! learn the remote transfer id from the first reply.

use super::backend::{Reader, Writer};
use super::error::Error;
use super::options::Options;
use super::packet;
use super::timer::{Step, TimedCaller};
use super::{ErrorCode, OpCode, DEFAULT_BLOCK_SIZE, HEADER_LEN};
use bytes::Bytes;
use log::{debug, trace, warn};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{self, Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Origin {
    Remote,
    Local,
}

/// Per-session knobs; the defaults are the protocol's. Tests shrink the
/// clocks, the dispatcher and client apply negotiated options.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub block_size: usize,
    /// Write side: resettable inactivity timer, also the dally period.
    pub idle_timeout: Duration,
    /// Read side: successive waits between (re)sends of one block; the
    /// final wait times the transfer out.
    pub retry_schedule: Vec<Duration>,
    /// OACK retransmission ladder during option negotiation.
    pub handshake_schedule: Vec<Duration>,
    /// Local origin: how long to wait for the first reply to our request.
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            idle_timeout: Duration::from_secs(10),
            retry_schedule: vec![
                Duration::from_secs(3),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            handshake_schedule: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5),
            ],
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    fn apply(&mut self, options: &Options) {
        if options.get("blksize").is_some() {
            self.block_size = options.blksize();
        }
        if let Some(timeout) = options.timeout() {
            let timeout = Duration::from_secs(timeout);
            self.idle_timeout = timeout;
            self.retry_schedule = vec![timeout; 3];
        }
    }
}

/// Datagrams from a port that is not the session's transfer id get exactly
/// one ERROR(5) back and change nothing.
async fn unknown_tid(sock: &UdpSocket, addr: SocketAddr) {
    trace!("[{}] datagram from unknown transfer id", addr);
    let _ = sock
        .send_to(&packet::error_from_code(ErrorCode::UnknownTId), addr)
        .await;
}

/// Wrapping comparison: is `got` behind `next` on the 16-bit block circle?
fn behind(got: u16, next: u16) -> bool {
    got.wrapping_sub(next) >= 0x8000
}

pub struct WriteSession {
    sock: UdpSocket,
    remote: SocketAddr,
    writer: Box<dyn Writer>,
    origin: Origin,
    options: Options,
    config: SessionConfig,
    blocknum: u16,
    completed: bool,
    backend_done: bool,
}

impl WriteSession {
    /// Session for a WRQ the dispatcher accepted. `options` is the already
    /// negotiated set; it is applied before any datagram goes out.
    pub fn remote_origin(
        sock: UdpSocket,
        remote: SocketAddr,
        writer: Box<dyn Writer>,
        options: Options,
        mut config: SessionConfig,
    ) -> WriteSession {
        config.apply(&options);
        WriteSession {
            sock,
            remote,
            writer,
            origin: Origin::Remote,
            options,
            config,
            blocknum: 0,
            completed: false,
            backend_done: false,
        }
    }

    /// Session for a transfer this endpoint requested with an RRQ. The
    /// remote transfer id is fixed by the server's first reply; options are
    /// taken from its OACK, if any.
    pub fn local_origin(
        sock: UdpSocket,
        server: SocketAddr,
        writer: Box<dyn Writer>,
        config: SessionConfig,
    ) -> WriteSession {
        WriteSession {
            sock,
            remote: server,
            writer,
            origin: Origin::Local,
            options: Options::new(),
            config,
            blocknum: 0,
            completed: false,
            backend_done: false,
        }
    }

    pub async fn run(mut self) -> Result<(), Error> {
        trace!(
            "[{}] write session started ({:?} origin)",
            self.remote,
            self.origin
        );

        let ret = self.drive().await;
        self.release().await;
        if let Err(e) = &ret {
            warn!("[{}] write session ended: {:?}", self.remote, e);
        }
        ret
    }

    async fn drive(&mut self) -> Result<(), Error> {
        match self.origin {
            Origin::Remote => self.bootstrap_remote().await?,
            Origin::Local => self.bootstrap_local().await?,
        }
        self.steady().await
    }

    /// Finalizes the backend exactly once, whichever way the session ends.
    async fn release(&mut self) {
        if !self.backend_done {
            self.backend_done = true;
            self.writer.cancel().await;
        }
    }

    async fn bootstrap_remote(&mut self) -> Result<(), Error> {
        if self.options.is_empty() {
            self.sock.send_to(&packet::ack(0), self.remote).await?;
            return Ok(());
        }

        let oack = packet::oack(&self.options);
        self.sock.send_to(&oack, self.remote).await?;
        trace!("[{}] sent OACK, waiting for first block", self.remote);

        let mut caller = TimedCaller::new(self.config.handshake_schedule.clone());
        let mut buf = vec![0u8; self.config.block_size + HEADER_LEN];
        loop {
            tokio::select! {
                step = caller.step() => match step {
                    Step::Call => {
                        trace!("[{}] retransmitting OACK", self.remote);
                        self.sock.send_to(&oack, self.remote).await?;
                    }
                    Step::Last => {
                        warn!("[{}] option negotiation timed out", self.remote);
                        return Err(Error::Timedout);
                    }
                },
                recv = self.sock.recv_from(&mut buf) => {
                    let (n, addr) = recv?;
                    if addr != self.remote {
                        unknown_tid(&self.sock, addr).await;
                        continue;
                    }

                    let mut dgram = Bytes::copy_from_slice(&buf[..n]);
                    match packet::parse_opcode(&mut dgram) {
                        Ok(OpCode::Data) => {
                            let Ok((blocknum, payload)) = packet::parse_data(&mut dgram) else {
                                continue;
                            };
                            caller.cancel();
                            self.on_data(blocknum, payload).await?;
                            return Ok(());
                        }
                        Ok(OpCode::Error) => return Err(peer_abort(&mut dgram, self.remote)),
                        Ok(op) => trace!("[{}] ignored {:?} during negotiation", self.remote, op),
                        Err(_) => trace!("[{}] ignored malformed datagram", self.remote),
                    }
                }
            }
        }
    }

    async fn bootstrap_local(&mut self) -> Result<(), Error> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut buf = vec![0u8; self.config.block_size + HEADER_LEN];
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => {
                    warn!("[{}] no reply to read request", self.remote);
                    return Err(Error::Timedout);
                }
                recv = self.sock.recv_from(&mut buf) => {
                    let (n, addr) = recv?;
                    if addr.ip() != self.remote.ip() {
                        unknown_tid(&self.sock, addr).await;
                        continue;
                    }

                    let mut dgram = Bytes::copy_from_slice(&buf[..n]);
                    match packet::parse_opcode(&mut dgram) {
                        Ok(OpCode::Oack) => {
                            let Ok(options) = packet::parse_oack(&mut dgram) else {
                                continue;
                            };
                            trace!("[{}] received OACK {:?}", addr, options);
                            // value sanity only; a confused server must not
                            // dictate an out-of-range block size
                            let options = options.negotiate(&Options::new());
                            self.config.apply(&options);
                            self.options = options;
                            self.remote = addr;
                            self.sock.send_to(&packet::ack(0), self.remote).await?;
                            return Ok(());
                        }
                        Ok(OpCode::Data) => {
                            let Ok((blocknum, payload)) = packet::parse_data(&mut dgram) else {
                                continue;
                            };
                            self.remote = addr;
                            self.on_data(blocknum, payload).await?;
                            return Ok(());
                        }
                        Ok(OpCode::Error) => return Err(peer_abort(&mut dgram, addr)),
                        Ok(op) => trace!("[{}] ignored {:?} during handshake", addr, op),
                        Err(_) => trace!("[{}] ignored malformed datagram", addr),
                    }
                }
            }
        }
    }

    async fn steady(&mut self) -> Result<(), Error> {
        let mut buf = vec![0u8; self.config.block_size + HEADER_LEN];
        let mut deadline = Instant::now() + self.config.idle_timeout;
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => {
                    return if self.completed {
                        trace!("[{}] dally period over", self.remote);
                        Ok(())
                    } else {
                        warn!("[{}] timed out waiting for next block", self.remote);
                        Err(Error::Timedout)
                    };
                }
                recv = self.sock.recv_from(&mut buf) => {
                    let (n, addr) = recv?;
                    if addr != self.remote {
                        unknown_tid(&self.sock, addr).await;
                        continue;
                    }

                    let mut dgram = Bytes::copy_from_slice(&buf[..n]);
                    match packet::parse_opcode(&mut dgram) {
                        Ok(OpCode::Data) => {
                            let Ok((blocknum, payload)) = packet::parse_data(&mut dgram) else {
                                continue;
                            };
                            if self.on_data(blocknum, payload).await? {
                                deadline = Instant::now() + self.config.idle_timeout;
                            }
                        }
                        Ok(OpCode::Error) => return Err(peer_abort(&mut dgram, self.remote)),
                        Ok(OpCode::Oack) if self.origin == Origin::Local => {
                            // server missed our ACK(0)
                            trace!("[{}] duplicate OACK, re-acknowledging", self.remote);
                            self.sock.send_to(&packet::ack(0), self.remote).await?;
                        }
                        Ok(op) => trace!("[{}] ignored {:?}", self.remote, op),
                        Err(_) => trace!("[{}] ignored malformed datagram", self.remote),
                    }
                }
            }
        }
    }

    /// Handles one DATA datagram; returns whether the idle timer resets.
    async fn on_data(&mut self, blocknum: u16, payload: Bytes) -> Result<bool, Error> {
        let next = self.blocknum.wrapping_add(1);

        if blocknum == next {
            if self.completed {
                self.sock
                    .send_to(
                        &packet::error(ErrorCode::IllegalTftpOp, "Transfer already finished"),
                        self.remote,
                    )
                    .await?;
                return Ok(false);
            }

            if let Err(e) = self.writer.write(&payload).await {
                self.sock
                    .send_to(&packet::error_from_code(ErrorCode::DiskFull), self.remote)
                    .await?;
                return Err(e);
            }

            self.sock
                .send_to(&packet::ack(blocknum), self.remote)
                .await?;
            self.blocknum = next;
            trace!(
                "[{}] wrote block #{} ({} bytes)",
                self.remote,
                blocknum,
                payload.len()
            );

            if payload.len() < self.config.block_size {
                self.completed = true;
                self.writer.finish().await?;
                self.backend_done = true;
                debug!("[{}] transfer complete, dallying", self.remote);
            }
            Ok(true)
        } else if behind(blocknum, next) {
            trace!("[{}] duplicate DATA #{}", self.remote, blocknum);
            self.sock
                .send_to(&packet::ack(blocknum), self.remote)
                .await?;
            Ok(true)
        } else {
            self.sock
                .send_to(
                    &packet::error(ErrorCode::IllegalTftpOp, "Block number mismatch"),
                    self.remote,
                )
                .await?;
            Ok(false)
        }
    }
}

pub struct ReadSession {
    sock: UdpSocket,
    remote: SocketAddr,
    reader: Box<dyn Reader>,
    origin: Origin,
    options: Options,
    config: SessionConfig,
    blocknum: u16,
    completed: bool,
    /// Wire bytes of whatever is awaiting acknowledgement (OACK or DATA).
    current: Bytes,
    retransmit: TimedCaller,
    backend_done: bool,
}

impl ReadSession {
    /// Session for an RRQ the dispatcher accepted, with the negotiated
    /// option set.
    pub fn remote_origin(
        sock: UdpSocket,
        remote: SocketAddr,
        reader: Box<dyn Reader>,
        options: Options,
        mut config: SessionConfig,
    ) -> ReadSession {
        config.apply(&options);
        ReadSession {
            sock,
            remote,
            reader,
            origin: Origin::Remote,
            options,
            config,
            blocknum: 0,
            completed: false,
            current: Bytes::new(),
            retransmit: TimedCaller::idle(),
            backend_done: false,
        }
    }

    /// Session for a transfer this endpoint requested with a WRQ.
    pub fn local_origin(
        sock: UdpSocket,
        server: SocketAddr,
        reader: Box<dyn Reader>,
        config: SessionConfig,
    ) -> ReadSession {
        ReadSession {
            sock,
            remote: server,
            reader,
            origin: Origin::Local,
            options: Options::new(),
            config,
            blocknum: 0,
            completed: false,
            current: Bytes::new(),
            retransmit: TimedCaller::idle(),
            backend_done: false,
        }
    }

    pub async fn run(mut self) -> Result<(), Error> {
        trace!(
            "[{}] read session started ({:?} origin)",
            self.remote,
            self.origin
        );

        let ret = self.drive().await;
        self.release().await;
        if let Err(e) = &ret {
            warn!("[{}] read session ended: {:?}", self.remote, e);
        }
        ret
    }

    async fn drive(&mut self) -> Result<(), Error> {
        match self.origin {
            Origin::Remote => {
                if self.options.is_empty() {
                    self.next_block().await?;
                } else {
                    // OACK awaits ACK(0) under the handshake ladder; the
                    // steady loop treats it like any unacknowledged send
                    self.current = packet::oack(&self.options);
                    self.sock.send_to(&self.current, self.remote).await?;
                    self.retransmit = TimedCaller::new(self.config.handshake_schedule.clone());
                    trace!("[{}] sent OACK, waiting for ACK 0", self.remote);
                }
            }
            Origin::Local => self.bootstrap_local().await?,
        }
        self.steady().await
    }

    async fn release(&mut self) {
        if !self.backend_done {
            self.backend_done = true;
            self.reader.finish().await;
        }
    }

    async fn bootstrap_local(&mut self) -> Result<(), Error> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut buf = vec![0u8; self.config.block_size + HEADER_LEN];
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => {
                    warn!("[{}] no reply to write request", self.remote);
                    return Err(Error::Timedout);
                }
                recv = self.sock.recv_from(&mut buf) => {
                    let (n, addr) = recv?;
                    if addr.ip() != self.remote.ip() {
                        unknown_tid(&self.sock, addr).await;
                        continue;
                    }

                    let mut dgram = Bytes::copy_from_slice(&buf[..n]);
                    match packet::parse_opcode(&mut dgram) {
                        Ok(OpCode::Oack) => {
                            let Ok(options) = packet::parse_oack(&mut dgram) else {
                                continue;
                            };
                            trace!("[{}] received OACK {:?}", addr, options);
                            let options = options.negotiate(&Options::new());
                            self.config.apply(&options);
                            self.options = options;
                            self.remote = addr;
                            self.next_block().await?;
                            return Ok(());
                        }
                        Ok(OpCode::Ack) => {
                            let Ok(acked) = packet::parse_ack(&mut dgram) else {
                                continue;
                            };
                            if acked != 0 {
                                continue;
                            }
                            self.remote = addr;
                            self.next_block().await?;
                            return Ok(());
                        }
                        Ok(OpCode::Error) => return Err(peer_abort(&mut dgram, addr)),
                        Ok(op) => trace!("[{}] ignored {:?} during handshake", addr, op),
                        Err(_) => trace!("[{}] ignored malformed datagram", addr),
                    }
                }
            }
        }
    }

    async fn steady(&mut self) -> Result<(), Error> {
        let mut buf = vec![0u8; self.config.block_size + HEADER_LEN];
        loop {
            tokio::select! {
                step = self.retransmit.step() => match step {
                    Step::Call => {
                        trace!("[{}] retransmitting block #{}", self.remote, self.blocknum);
                        self.sock.send_to(&self.current, self.remote).await?;
                    }
                    Step::Last => {
                        warn!("[{}] retransmissions exhausted", self.remote);
                        return Err(Error::Timedout);
                    }
                },
                recv = self.sock.recv_from(&mut buf) => {
                    let (n, addr) = recv?;
                    if addr != self.remote {
                        unknown_tid(&self.sock, addr).await;
                        continue;
                    }

                    let mut dgram = Bytes::copy_from_slice(&buf[..n]);
                    match packet::parse_opcode(&mut dgram) {
                        Ok(OpCode::Ack) => {
                            let Ok(acked) = packet::parse_ack(&mut dgram) else {
                                continue;
                            };
                            if self.on_ack(acked).await? {
                                return Ok(());
                            }
                        }
                        Ok(OpCode::Error) => return Err(peer_abort(&mut dgram, self.remote)),
                        Ok(OpCode::Oack) if self.origin == Origin::Local => {
                            // server missed our first block and repeated its OACK
                            trace!("[{}] duplicate OACK ignored", self.remote);
                        }
                        Ok(op) => trace!("[{}] ignored {:?}", self.remote, op),
                        Err(_) => trace!("[{}] ignored malformed datagram", self.remote),
                    }
                }
            }
        }
    }

    /// Handles one ACK; returns true when the final block was acknowledged
    /// and the session is done.
    async fn on_ack(&mut self, acked: u16) -> Result<bool, Error> {
        if acked == self.blocknum {
            self.retransmit.cancel();
            if self.completed {
                debug!("[{}] final ACK received, transfer successful", self.remote);
                return Ok(true);
            }
            self.next_block().await?;
            Ok(false)
        } else if behind(acked, self.blocknum.wrapping_add(1)) {
            trace!("[{}] duplicate ACK #{}", self.remote, acked);
            Ok(false)
        } else {
            self.sock
                .send_to(
                    &packet::error(ErrorCode::IllegalTftpOp, "Block number mismatch"),
                    self.remote,
                )
                .await?;
            Ok(false)
        }
    }

    async fn next_block(&mut self) -> Result<(), Error> {
        self.blocknum = self.blocknum.wrapping_add(1);

        let data = match self.reader.read(self.config.block_size).await {
            Ok(data) => data,
            Err(e) => {
                let _ = self
                    .sock
                    .send_to(
                        &packet::error(ErrorCode::NotDefined, "Read failed"),
                        self.remote,
                    )
                    .await;
                return Err(e);
            }
        };

        if data.len() < self.config.block_size {
            self.completed = true;
        }

        trace!(
            "[{}] sending block #{} ({} bytes)",
            self.remote,
            self.blocknum,
            data.len()
        );
        self.current = packet::data(self.blocknum, &data);
        self.sock.send_to(&self.current, self.remote).await?;
        self.retransmit = TimedCaller::new(self.config.retry_schedule.clone());
        Ok(())
    }
}

fn peer_abort(dgram: &mut Bytes, addr: SocketAddr) -> Error {
    let (code, message) = match packet::parse_error(dgram) {
        Ok((code, message)) => (code as u16, message),
        Err(_) => (ErrorCode::NotDefined as u16, String::new()),
    };
    debug!("[{}] peer aborted: [{}] {}", addr, code, message);
    Error::Peer(code, message)
}
