mod cli;
mod client;
mod packet;
mod transfer;

pub use crate::cli::Cli;
pub use crate::client::{ClientHandle, Command, Package, TftpClient};
pub use crate::packet::{TftpPacket, TransferMode};

pub const BLOCK_SIZE: usize = 512; // RFC 1350
pub const DATAGRAM_SIZE: usize = 516; // 2B opcode + 2B block + 512B data

pub const DEF_PORT: u16 = 69;
pub const DEF_TIMEOUT_MS: u64 = 1000;
pub const QUANT_MS: u64 = 25;
pub const DEF_ATTEMPTS: u8 = 4;
