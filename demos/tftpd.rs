use clap::{Arg, ArgAction, Command};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tftpkit::backend::FilesystemBackend;
use tftpkit::error::Error;
use tftpkit::options::OptionBuilder;
use tftpkit::server::Server;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let matches = Command::new("tftpkit server")
        .arg(
            Arg::new("bind")
                .short('i')
                .long("bind")
                .default_value("0.0.0.0")
                .value_name("IPADDRESS")
                .value_parser(clap::value_parser!(IpAddr))
                .help("bind server's IP address."),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .default_value("69")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("bind server's port."),
        )
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .default_value(".")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .help("publish TFTP root directory."),
        )
        .arg(
            Arg::new("blksize")
                .short('b')
                .long("blksize")
                .value_name("BLKSIZE")
                .value_parser(clap::value_parser!(u16))
                .help("largest negotiable blksize."),
        )
        .arg(
            Arg::new("read-only")
                .long("read-only")
                .action(ArgAction::SetTrue)
                .help("reject write requests."),
        )
        .get_matches();

    let address = *matches.get_one::<IpAddr>("bind").unwrap();
    let port = *matches.get_one::<u16>("port").unwrap();
    let root = matches.get_one::<PathBuf>("root").unwrap();

    let mut backend = FilesystemBackend::new(root)?;
    if matches.get_flag("read-only") {
        backend = backend.with_permissions(true, false);
    }

    let mut limits = OptionBuilder::default();
    if let Some(&blksize) = matches.get_one::<u16>("blksize") {
        limits = limits.blksize(blksize);
    }

    let server = Server::new(SocketAddr::new(address, port), backend)
        .await?
        .with_limits(limits.build());
    server.serve_forever().await
}
