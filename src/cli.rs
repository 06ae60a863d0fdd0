use anstyle::AnsiColor;
use clap::builder::styling::Styles;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::Config;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default())
    .usage(AnsiColor::Green.on_default())
    .literal(AnsiColor::Cyan.on_default())
    .placeholder(AnsiColor::Red.on_default());

#[derive(Parser, Debug)]
#[command(name = "tftpd")]
#[command(about = "A read-only TFTP server", long_about = None)]
#[command(styles = STYLES)]
pub struct Cli {
    /// Listen ip
    #[arg(short, long, default_value = "127.0.0.1")]
    pub ip: IpAddr,

    /// Listen Port
    #[arg(short, long, default_value_t = 69)]
    pub port: u16,

    /// File served to every client
    #[arg(short = 'f', long, default_value = "payload.svg")]
    pub payload: PathBuf,

    /// Timeout (ms)
    #[arg(short, long, default_value_t = crate::DEF_TIMEOUT_MS)]
    pub timeout: u64,

    /// Max retries
    #[arg(short, long, default_value_t = crate::DEF_RETRY_COUNT)]
    pub retry: u8,
}

impl Cli {
    pub fn config(&self) -> Config {
        Config {
            listen: SocketAddr::new(self.ip, self.port),
            timeout: Duration::from_millis(self.timeout),
            retries: self.retry,
            ..Config::default()
        }
    }
}
