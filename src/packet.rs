use anyhow::{anyhow, bail};
use clap::ValueEnum;
use std::fmt;
use std::str;

use crate::DATAGRAM_SIZE;

/// Transfer mode carried in RRQ/WRQ requests. Only the mode string on the
/// wire depends on it; no newline translation happens in this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransferMode {
    Netascii,
    Octet,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
        }
    }
}

impl str::FromStr for TransferMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "netascii" => Ok(TransferMode::Netascii),
            "octet" => Ok(TransferMode::Octet),
            _ => Err(anyhow!("Unknown transfer mode: {s}")),
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpPacket {
    RRQ { filename: String, mode: String },
    WRQ { filename: String, mode: String },
    DATA { block: u16, data: Vec<u8> },
    ACK(u16),
    ERROR { code: u16, msg: String },
}

impl TftpPacket {
    /// Wire encoding. Fails if the assembled packet would exceed the
    /// datagram capacity; it never truncates.
    pub fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        let mut bytes: Vec<u8> = vec![0];

        match self {
            TftpPacket::RRQ { filename, mode } | TftpPacket::WRQ { filename, mode } => {
                if let TftpPacket::RRQ { .. } = self {
                    bytes.push(1);
                } else {
                    bytes.push(2);
                }
                bytes.extend(filename.as_bytes());
                bytes.push(0);
                bytes.extend(mode.as_bytes());
                bytes.push(0);
            }
            TftpPacket::DATA { block, data } => {
                bytes.push(3);
                bytes.extend(block.to_be_bytes());
                bytes.extend_from_slice(data);
            }
            TftpPacket::ACK(block) => {
                bytes.push(4);
                bytes.extend(block.to_be_bytes());
            }
            TftpPacket::ERROR { code, msg } => {
                bytes.push(5);
                bytes.extend(code.to_be_bytes());
                bytes.extend_from_slice(msg.as_bytes());
                bytes.push(0);
            }
        }

        if bytes.len() > DATAGRAM_SIZE {
            bail!(
                "Packet exceeds datagram capacity: {} > {}",
                bytes.len(),
                DATAGRAM_SIZE
            );
        }
        Ok(bytes)
    }

    pub fn deserialize(buf: &[u8]) -> anyhow::Result<Self> {
        if buf.len() < 2 {
            return Err(anyhow!("Packet length too short"));
        }

        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let pkt = match opcode {
            1 | 2 => {
                let filename = read_cstr(&buf[2..])?;
                let mode = read_cstr(&buf[2 + filename.len() + 1..])?;
                if opcode == 1 {
                    TftpPacket::RRQ { filename, mode }
                } else {
                    TftpPacket::WRQ { filename, mode }
                }
            }
            3 => {
                if buf.len() < 4 {
                    return Err(anyhow!("Data packet too short"));
                }
                let block = u16::from_be_bytes([buf[2], buf[3]]);
                let data = buf[4..].to_vec();

                TftpPacket::DATA { block, data }
            }
            4 => {
                if buf.len() < 4 {
                    return Err(anyhow!("Ack packet too short"));
                }
                TftpPacket::ACK(u16::from_be_bytes([buf[2], buf[3]]))
            }
            5 => {
                if buf.len() < 4 {
                    return Err(anyhow!("Error packet too short"));
                }
                let code = u16::from_be_bytes([buf[2], buf[3]]);
                let msg = read_cstr(&buf[4..])?;

                TftpPacket::ERROR { code, msg }
            }
            _ => {
                return Err(anyhow!("Invalid opcode: {}", opcode));
            }
        };

        Ok(pkt)
    }
}

fn read_cstr(buf: &[u8]) -> anyhow::Result<String> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(anyhow!("Missing cstr terminator"))?;
    let s = str::from_utf8(&buf[..pos])
        .map_err(|_| anyhow!("Invalid cstr encoding"))?
        .to_string();
    Ok(s)
}
