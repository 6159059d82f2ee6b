use super::backend::{FilesystemReader, FilesystemWriter, Reader, Writer};
use super::error::Error;
use super::netascii::{NetasciiReader, NetasciiWriter};
use super::options::Options;
use super::packet;
use super::session::{ReadSession, SessionConfig, WriteSession};
use log::trace;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use tokio::net::UdpSocket;

/// Drives transfers this endpoint initiates. A `get` downloads into a
/// local-origin write session, a `put` uploads through a local-origin read
/// session; either way the server's first reply fixes its transfer id.
pub struct Client {
    remote_addr: SocketAddr,
    mode: String,
    options: Options,
    config: SessionConfig,
}

impl Client {
    pub fn new(remote_addr: SocketAddr, mode: &str, options: Options) -> Client {
        Client {
            remote_addr,
            mode: mode.to_string(),
            options,
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Client {
        self.config = config;
        self
    }

    pub async fn get(&self, local_file: &Path, remote_file: &str) -> Result<(), Error> {
        let writer = FilesystemWriter::create(local_file).await?;
        let writer: Box<dyn Writer> = if self.is_netascii() {
            Box::new(NetasciiWriter::new(writer))
        } else {
            Box::new(writer)
        };

        let sock = self.bind().await?;
        let req = packet::Request::rrq(remote_file, &self.mode, &self.options);
        sock.send_to(&packet::request(&req), self.remote_addr)
            .await?;
        trace!("[{}] sent RRQ \"{}\"", self.remote_addr, remote_file);

        WriteSession::local_origin(sock, self.remote_addr, writer, self.config.clone())
            .run()
            .await
    }

    pub async fn put(&self, local_file: &Path, remote_file: &str) -> Result<(), Error> {
        let reader = FilesystemReader::open(local_file).await?;

        let req = packet::Request::wrq(remote_file, &self.mode, &self.options);

        let reader: Box<dyn Reader> = if self.is_netascii() {
            Box::new(NetasciiReader::new(reader))
        } else {
            Box::new(reader)
        };

        let sock = self.bind().await?;
        sock.send_to(&packet::request(&req), self.remote_addr)
            .await?;
        trace!("[{}] sent WRQ \"{}\"", self.remote_addr, remote_file);

        ReadSession::local_origin(sock, self.remote_addr, reader, self.config.clone())
            .run()
            .await
    }

    fn is_netascii(&self) -> bool {
        self.mode.eq_ignore_ascii_case("netascii")
    }

    /// Ephemeral local socket in the server's address family.
    async fn bind(&self) -> Result<UdpSocket, Error> {
        let unspecified: IpAddr = match self.remote_addr {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        Ok(UdpSocket::bind((unspecified, 0)).await?)
    }
}
