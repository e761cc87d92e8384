use anstyle::AnsiColor;
use clap::builder::styling::Styles;
use clap::Parser;
use std::net::IpAddr;

use crate::packet::TransferMode;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default())
    .usage(AnsiColor::Green.on_default())
    .literal(AnsiColor::Cyan.on_default())
    .placeholder(AnsiColor::Red.on_default());

#[derive(Parser, Debug)]
#[command(name = "tftpc")]
#[command(about = "An interactive TFTP client", long_about = None)]
#[command(styles = STYLES)]
pub struct Cli {
    /// Server ip
    #[arg(default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Server port
    #[arg(short, long, default_value_t = crate::DEF_PORT)]
    pub port: u16,

    /// Initial transfer mode
    #[arg(short, long, value_enum, default_value_t = TransferMode::Netascii)]
    pub mode: TransferMode,

    /// Reply timeout (ms)
    #[arg(short, long, default_value_t = crate::DEF_TIMEOUT_MS)]
    pub timeout: u64,

    /// Attempts per exchange
    #[arg(short, long, default_value_t = crate::DEF_ATTEMPTS)]
    pub retry: u8,
}
