use super::backend::{Backend, Reader, Writer};
use super::error::Error;
use super::netascii::{NetasciiReader, NetasciiWriter};
use super::options::Options;
use super::packet;
use super::session::{ReadSession, SessionConfig, WriteSession};
use super::{ErrorCode, OpCode};
use bytes::Bytes;
use log::{debug, error, trace, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Listens on the well-known port and spawns one session per accepted
/// request, each bound to a fresh ephemeral port. The listening socket is
/// never shared with a session.
pub struct Server {
    sock: UdpSocket,
    local_ip: IpAddr,
    backend: Arc<dyn Backend>,
    limits: Options,
    config: SessionConfig,
}

impl Server {
    pub async fn new(
        service_addr: SocketAddr,
        backend: impl Backend + 'static,
    ) -> Result<Server, Error> {
        let sock = UdpSocket::bind(service_addr).await?;
        let local_ip = sock.local_addr()?.ip();
        Ok(Server {
            sock,
            local_ip,
            backend: Arc::new(backend),
            limits: Options::new(),
            config: SessionConfig::default(),
        })
    }

    /// Caps applied to requested options during negotiation, e.g. a largest
    /// acceptable `blksize`.
    pub fn with_limits(mut self, limits: Options) -> Server {
        self.limits = limits;
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Server {
        self.config = config;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.sock.local_addr()?)
    }

    pub async fn serve_forever(self) -> Result<(), Error> {
        debug!("listening on {}", self.sock.local_addr()?);

        let mut buf = vec![0u8; 1024];
        loop {
            let (n, remote_addr) = self.sock.recv_from(&mut buf).await?;
            let mut dgram = Bytes::copy_from_slice(&buf[..n]);

            // anything that is not a well-formed RRQ/WRQ is dropped without
            // a reply
            let req = match packet::parse_request(&mut dgram) {
                Ok(req) => req,
                Err(e) => {
                    trace!("[{}] ignored datagram: {:?}", remote_addr, e);
                    continue;
                }
            };

            trace!(
                "[{}] {:?} \"{}\" mode {} options {:?}",
                remote_addr,
                req.op_code(),
                req.filename(),
                req.mode(),
                req.options()
            );
            self.dispatch(req, remote_addr).await;
        }
    }

    async fn dispatch(&self, req: packet::Request, remote: SocketAddr) {
        let mode = req.mode();
        let is_netascii = mode.eq_ignore_ascii_case("netascii");
        if !is_netascii && !mode.eq_ignore_ascii_case("octet") {
            warn!("[{}] unknown transfer mode \"{}\"", remote, mode);
            let message = format!(
                "Unknown transfer mode {}, - expected 'netascii' or 'octet' (case-insensitive)",
                mode
            );
            let reply = packet::error(ErrorCode::IllegalTftpOp, &message);
            let _ = self.sock.send_to(&reply, remote).await;
            return;
        }

        match req.op_code() {
            OpCode::Rrq => {
                let reader = match self.backend.get_reader(req.filename()).await {
                    Ok(reader) => reader,
                    Err(e) => return self.reject(remote, e).await,
                };

                let accepted = req.options().negotiate(&self.limits);

                let reader: Box<dyn Reader> = if is_netascii {
                    Box::new(NetasciiReader::new(reader))
                } else {
                    reader
                };

                let Some(session_sock) = self.transfer_socket(remote).await else {
                    return;
                };

                debug!("[{}] serving \"{}\"", remote, req.filename());
                let session = ReadSession::remote_origin(
                    session_sock,
                    remote,
                    reader,
                    accepted,
                    self.config.clone(),
                );
                tokio::spawn(session.run());
            }
            OpCode::Wrq => {
                let writer = match self.backend.get_writer(req.filename()).await {
                    Ok(writer) => writer,
                    Err(e) => return self.reject(remote, e).await,
                };

                let accepted = req.options().negotiate(&self.limits);

                let writer: Box<dyn Writer> = if is_netascii {
                    Box::new(NetasciiWriter::new(writer))
                } else {
                    writer
                };

                let Some(session_sock) = self.transfer_socket(remote).await else {
                    return;
                };

                debug!("[{}] receiving \"{}\"", remote, req.filename());
                let session = WriteSession::remote_origin(
                    session_sock,
                    remote,
                    writer,
                    accepted,
                    self.config.clone(),
                );
                tokio::spawn(session.run());
            }
            _ => unreachable!("parse_request only yields requests"),
        }
    }

    /// Fresh ephemeral socket in the listener's address family.
    async fn transfer_socket(&self, remote: SocketAddr) -> Option<UdpSocket> {
        match UdpSocket::bind((self.local_ip, 0)).await {
            Ok(sock) => Some(sock),
            Err(e) => {
                error!("[{}] failed to bind a transfer socket: {}", remote, e);
                None
            }
        }
    }

    async fn reject(&self, remote: SocketAddr, error: Error) {
        warn!("[{}] request rejected: {:?}", remote, error);
        let reply = packet::error(error.error_code(), &error.wire_message());
        let _ = self.sock.send_to(&reply, remote).await;
    }
}
