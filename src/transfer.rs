use anyhow::bail;
use log::{debug, warn};
use std::io::{Read, Write};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

use crate::client::Package;
use crate::packet::TftpPacket;
use crate::{BLOCK_SIZE, QUANT_MS};

/// Verdict on one inbound package while a reply is awaited.
pub(crate) enum Verdict {
    /// The package the flow is waiting for.
    Accept,
    /// Wrong kind, wrong block or wrong sender. Logged and discarded.
    Drop,
    /// Peer signalled a protocol error. Ends the transfer.
    Abort(String),
}

/// What the flow wants after absorbing an accepted package.
pub(crate) enum Step {
    /// Send this package next and await its reply.
    Next(Package),
    /// Transfer complete. An optional final package (the closing ACK)
    /// is sent once, without awaiting anything.
    Done(Option<Package>),
}

/// Direction-specific half of a transfer. `drive` owns the retry loop;
/// the flow owns block matching and payload handling.
pub(crate) trait Flow {
    fn classify(&self, pkg: &Package) -> Verdict;
    fn absorb(&mut self, pkg: Package) -> anyhow::Result<Step>;
}

/// Network side of a transfer: the shared socket plus the inbound
/// channel fed by the receive loop.
pub(crate) struct Exchange<'a> {
    pub socket: &'a UdpSocket,
    pub inbound: &'a mut mpsc::UnboundedReceiver<Package>,
    pub timeout: Duration,
    pub attempts: u8,
}

impl Exchange<'_> {
    async fn send(&self, pkg: &Package) -> anyhow::Result<()> {
        let bytes = pkg.packet.serialize()?;
        self.socket.send_to(&bytes, pkg.addr).await?;
        Ok(())
    }

    /// Poll the inbound channel in quantum slices until the flow accepts
    /// a package or the timeout window closes. Returns `None` on timeout.
    async fn await_reply<F: Flow>(&mut self, flow: &F) -> anyhow::Result<Option<Package>> {
        let quant = Duration::from_millis(QUANT_MS);
        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            match timeout(quant, self.inbound.recv()).await {
                Ok(Some(pkg)) => match flow.classify(&pkg) {
                    Verdict::Accept => return Ok(Some(pkg)),
                    Verdict::Drop => {
                        warn!("Unexpected package from {}, dropping: {:?}", pkg.addr, pkg.packet);
                    }
                    Verdict::Abort(reason) => bail!(reason),
                },
                Ok(None) => bail!("Inbound channel closed"),
                Err(_) => (),
            }
        }
        Ok(None)
    }
}

/// Lock-step request/response engine shared by GET and PUT.
///
/// Sends the outstanding package, waits for the flow to accept a reply,
/// and resends the *same* package on timeout. A reply refills the attempt
/// budget; running it dry fails the transfer.
pub(crate) async fn drive<F: Flow>(
    io: &mut Exchange<'_>,
    flow: &mut F,
    opening: Package,
) -> anyhow::Result<()> {
    let mut outstanding = opening;
    let mut attempts = io.attempts;
    while attempts > 0 {
        io.send(&outstanding).await?;
        match io.await_reply(flow).await? {
            Some(pkg) => {
                attempts = io.attempts;
                match flow.absorb(pkg)? {
                    Step::Next(next) => outstanding = next,
                    Step::Done(closing) => {
                        if let Some(closing) = closing {
                            io.send(&closing).await?;
                        }
                        return Ok(());
                    }
                }
            }
            None => {
                attempts -= 1;
                warn!(
                    "Timeout, resending {:?} ({attempts} attempts left)",
                    outstanding.packet
                );
            }
        }
    }
    bail!("Out of attempts")
}

/// GET direction: expects DATA blocks in order, acks each one, appends
/// payloads to the sink. A payload shorter than a full block ends the
/// transfer after its ACK goes out.
pub(crate) struct Download<W> {
    peer: Option<SocketAddr>,
    block: u16,
    sink: W,
    received: usize,
}

impl<W: Write> Download<W> {
    pub(crate) fn new(sink: W) -> Self {
        Self {
            peer: None,
            block: 1,
            sink,
            received: 0,
        }
    }

    pub(crate) fn received(&self) -> usize {
        self.received
    }
}

impl<W: Write> Flow for Download<W> {
    fn classify(&self, pkg: &Package) -> Verdict {
        let from_peer = self.peer.map_or(true, |peer| peer == pkg.addr);
        match &pkg.packet {
            TftpPacket::DATA { block, .. } if from_peer && *block == self.block => Verdict::Accept,
            TftpPacket::ERROR { code, msg } if from_peer => {
                Verdict::Abort(format!("Server error {code}: {msg}"))
            }
            _ => Verdict::Drop,
        }
    }

    fn absorb(&mut self, pkg: Package) -> anyhow::Result<Step> {
        let TftpPacket::DATA { block, data } = pkg.packet else {
            bail!("Download absorbed a non-data packet");
        };
        debug!("Block #{block} received ({} bytes)", data.len());

        self.sink.write_all(&data)?;
        self.received += data.len();
        // First matching DATA reveals the server's transfer port; every
        // later exchange of this transfer goes there.
        self.peer = Some(pkg.addr);

        let ack = Package {
            addr: pkg.addr,
            packet: TftpPacket::ACK(block),
        };
        if data.len() < BLOCK_SIZE {
            Ok(Step::Done(Some(ack)))
        } else {
            self.block = self.block.wrapping_add(1);
            Ok(Step::Next(ack))
        }
    }
}

/// PUT direction: expects ACKs in order, answers each with the next DATA
/// chunk. Once the short final chunk has been acknowledged nothing more
/// is built; files sized an exact multiple of the block size get a
/// trailing empty DATA packet so the server can detect the end.
pub(crate) struct Upload<R> {
    peer: Option<SocketAddr>,
    block: u16,
    source: R,
    last_len: usize,
    sent: usize,
}

impl<R: Read> Upload<R> {
    pub(crate) fn new(source: R) -> Self {
        Self {
            peer: None,
            block: 0,
            source,
            last_len: BLOCK_SIZE,
            sent: 0,
        }
    }

    pub(crate) fn sent(&self) -> usize {
        self.sent
    }
}

impl<R: Read> Flow for Upload<R> {
    fn classify(&self, pkg: &Package) -> Verdict {
        let from_peer = self.peer.map_or(true, |peer| peer == pkg.addr);
        match &pkg.packet {
            TftpPacket::ACK(block) if from_peer && *block == self.block => Verdict::Accept,
            TftpPacket::ERROR { code, msg } if from_peer => {
                Verdict::Abort(format!("Server error {code}: {msg}"))
            }
            _ => Verdict::Drop,
        }
    }

    fn absorb(&mut self, pkg: Package) -> anyhow::Result<Step> {
        let TftpPacket::ACK(block) = pkg.packet else {
            bail!("Upload absorbed a non-ack packet");
        };
        debug!("Block #{block} acknowledged");
        self.peer = Some(pkg.addr);

        if self.last_len < BLOCK_SIZE {
            return Ok(Step::Done(None));
        }

        let chunk = read_chunk(&mut self.source)?;
        self.block = self.block.wrapping_add(1);
        self.last_len = chunk.len();
        self.sent += chunk.len();
        Ok(Step::Next(Package {
            addr: pkg.addr,
            packet: TftpPacket::DATA {
                block: self.block,
                data: chunk,
            },
        }))
    }
}

/// Reads up to one block, stopping early only at end of file.
fn read_chunk<R: Read>(source: &mut R) -> std::io::Result<Vec<u8>> {
    let mut chunk = vec![0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = source.read(&mut chunk[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    chunk.truncate(filled);
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn data(addr: SocketAddr, block: u16, len: usize) -> Package {
        Package {
            addr,
            packet: TftpPacket::DATA {
                block,
                data: vec![0x55; len],
            },
        }
    }

    fn ack(addr: SocketAddr, block: u16) -> Package {
        Package {
            addr,
            packet: TftpPacket::ACK(block),
        }
    }

    #[test]
    fn download_accepts_only_the_expected_block() {
        let flow = Download::new(Vec::new());
        assert!(matches!(flow.classify(&data(addr(70), 1, 512)), Verdict::Accept));
        // duplicate and out-of-order blocks are dropped, not acked
        assert!(matches!(flow.classify(&data(addr(70), 0, 512)), Verdict::Drop));
        assert!(matches!(flow.classify(&data(addr(70), 2, 512)), Verdict::Drop));
        assert!(matches!(flow.classify(&ack(addr(70), 1)), Verdict::Drop));
    }

    #[test]
    fn download_binds_to_the_first_responder() {
        let mut flow = Download::new(Vec::new());
        flow.absorb(data(addr(70), 1, 512)).unwrap();

        assert!(matches!(flow.classify(&data(addr(70), 2, 512)), Verdict::Accept));
        assert!(matches!(flow.classify(&data(addr(71), 2, 512)), Verdict::Drop));
    }

    #[test]
    fn download_ends_on_a_short_block() {
        let mut flow = Download::new(Vec::new());

        let step = flow.absorb(data(addr(70), 1, 512)).unwrap();
        let Step::Next(next) = step else {
            panic!("full block must not end the transfer");
        };
        assert_eq!(next.packet, TftpPacket::ACK(1));

        let step = flow.absorb(data(addr(70), 2, 511)).unwrap();
        let Step::Done(Some(closing)) = step else {
            panic!("short block must end the transfer with a final ack");
        };
        assert_eq!(closing.packet, TftpPacket::ACK(2));
        assert_eq!(flow.received(), 1023);
    }

    #[test]
    fn download_peer_error_aborts() {
        let flow = Download::<Vec<u8>>::new(Vec::new());
        let pkg = Package {
            addr: addr(70),
            packet: TftpPacket::ERROR {
                code: 1,
                msg: "File not found".into(),
            },
        };
        assert!(matches!(flow.classify(&pkg), Verdict::Abort(_)));
    }

    #[test]
    fn upload_sends_one_short_chunk_and_finishes() {
        let mut flow = Upload::new(Cursor::new(vec![7u8; 10]));

        let step = flow.absorb(ack(addr(70), 0)).unwrap();
        let Step::Next(next) = step else {
            panic!("ack of the request must produce the first data block");
        };
        assert_eq!(
            next.packet,
            TftpPacket::DATA {
                block: 1,
                data: vec![7u8; 10],
            }
        );

        assert!(matches!(flow.classify(&ack(addr(70), 1)), Verdict::Accept));
        assert!(matches!(flow.classify(&ack(addr(70), 0)), Verdict::Drop));

        let step = flow.absorb(ack(addr(70), 1)).unwrap();
        assert!(matches!(step, Step::Done(None)));
        assert_eq!(flow.sent(), 10);
    }

    #[test]
    fn upload_appends_a_trailing_empty_block_on_exact_multiples() {
        let mut flow = Upload::new(Cursor::new(vec![1u8; 1024]));

        for block in 1..=2u16 {
            let step = flow.absorb(ack(addr(70), block - 1)).unwrap();
            let Step::Next(next) = step else {
                panic!("block #{block} must be a full data packet");
            };
            assert_eq!(
                next.packet,
                TftpPacket::DATA {
                    block,
                    data: vec![1u8; 512],
                }
            );
        }

        let step = flow.absorb(ack(addr(70), 2)).unwrap();
        let Step::Next(next) = step else {
            panic!("exact multiple needs a trailing empty block");
        };
        assert_eq!(
            next.packet,
            TftpPacket::DATA {
                block: 3,
                data: Vec::new(),
            }
        );

        let step = flow.absorb(ack(addr(70), 3)).unwrap();
        assert!(matches!(step, Step::Done(None)));
        assert_eq!(flow.sent(), 1024);
    }
}
