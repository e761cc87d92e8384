use anyhow::{anyhow, bail, Context};
use log::{error, info, warn};
use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task;
use tokio::time::{sleep, Duration};

use crate::packet::{TftpPacket, TransferMode};
use crate::transfer::{drive, Download, Exchange, Upload};
use crate::{DATAGRAM_SIZE, QUANT_MS};

/// One queued unit of work for the command loop. Consumed exactly once,
/// in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { remote: String, local: PathBuf },
    Put { local: PathBuf, remote: String },
    Quit,
}

/// A decoded datagram together with its sender, or an outbound packet
/// together with its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub addr: SocketAddr,
    pub packet: TftpPacket,
}

/// Long-running TFTP client: owns the socket, the command and inbound
/// channels, and the lifecycle flag shared by both loops.
pub struct TftpClient {
    server: SocketAddr,
    mode: Arc<Mutex<TransferMode>>,
    timeout: Duration,
    attempts: u8,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    socket: Option<Arc<UdpSocket>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
}

impl TftpClient {
    pub fn new(server: SocketAddr, mode: TransferMode, timeout: Duration, attempts: u8) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            server,
            mode: Arc::new(Mutex::new(mode)),
            timeout,
            attempts,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            socket: None,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
        }
    }

    /// Opens the datagram endpoint and marks the client running. Leaves
    /// the client idle on any failure.
    pub async fn connect(&mut self) -> anyhow::Result<()> {
        if self.socket.is_some() {
            bail!("Already connected");
        }
        info!("Connecting to {}", self.server);

        let bind_addr = if self.server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .context("Failed to open socket")?;
        socket
            .set_broadcast(true)
            .context("Failed to configure socket")?;

        self.socket = Some(Arc::new(socket));
        self.running.store(true, Ordering::SeqCst);
        info!("Connected");
        Ok(())
    }

    /// Runs the receive loop and the command loop until `terminate`
    /// flips the running flag. Blocks the caller for the client's whole
    /// lifetime.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let socket = self.socket.clone().context("Client is not connected")?;
        let mut cmd_rx = self.cmd_rx.take().context("Client is already running")?;
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();

        let listener = task::spawn(receive_loop(
            Arc::clone(&socket),
            inbound_tx,
            Arc::clone(&self.running),
            Arc::clone(&self.shutdown),
        ));

        self.command_loop(&socket, &mut cmd_rx, &mut inbound_rx).await;

        terminate(&self.running, &self.shutdown);
        let _ = listener.await;
        Ok(())
    }

    /// Cheap, cloneable façade for other threads: submit commands, flip
    /// the mode, observe or end the lifecycle.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            cmd_tx: self.cmd_tx.clone(),
            running: Arc::clone(&self.running),
            shutdown: Arc::clone(&self.shutdown),
            mode: Arc::clone(&self.mode),
        }
    }

    pub fn submit(&self, command: Command) -> anyhow::Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| anyhow!("Client is shut down"))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_mode(&self, mode: TransferMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn mode(&self) -> TransferMode {
        *self.mode.lock().unwrap()
    }

    pub fn terminate(&self) {
        terminate(&self.running, &self.shutdown);
    }

    /// Wakes every quantum, drains all queued commands at once and runs
    /// them to completion one at a time. A failed command is logged and
    /// discarded; it never poisons the ones behind it.
    async fn command_loop(
        &self,
        socket: &UdpSocket,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        inbound_rx: &mut mpsc::UnboundedReceiver<Package>,
    ) {
        let quant = Duration::from_millis(QUANT_MS);
        while self.running.load(Ordering::SeqCst) {
            sleep(quant).await;

            let mut batch = Vec::new();
            while let Ok(command) = cmd_rx.try_recv() {
                batch.push(command);
            }
            for command in batch {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                info!("Executing {command:?}");
                if let Err(e) = self.execute(command, socket, inbound_rx).await {
                    error!("Command failed: {e:#}");
                }
            }
        }
    }

    async fn execute(
        &self,
        command: Command,
        socket: &UdpSocket,
        inbound: &mut mpsc::UnboundedReceiver<Package>,
    ) -> anyhow::Result<()> {
        let mode = self.mode();
        let mut io = Exchange {
            socket,
            inbound,
            timeout: self.timeout,
            attempts: self.attempts,
        };

        match command {
            Command::Get { remote, local } => {
                let sink = File::create(&local)
                    .with_context(|| format!("Failed to create {}", local.display()))?;
                let mut flow = Download::new(sink);
                let opening = Package {
                    addr: self.server,
                    packet: TftpPacket::RRQ {
                        filename: remote.clone(),
                        mode: mode.as_str().into(),
                    },
                };
                drive(&mut io, &mut flow, opening).await?;
                info!(
                    "Received {remote} ({} bytes) into {}",
                    flow.received(),
                    local.display()
                );
            }
            Command::Put { local, remote } => {
                // Unreadable source fails here, before any network I/O.
                let source = File::open(&local)
                    .with_context(|| format!("Failed to open {}", local.display()))?;
                let mut flow = Upload::new(source);
                let opening = Package {
                    addr: self.server,
                    packet: TftpPacket::WRQ {
                        filename: remote.clone(),
                        mode: mode.as_str().into(),
                    },
                };
                drive(&mut io, &mut flow, opening).await?;
                info!(
                    "Sent {} ({} bytes) as {remote}",
                    local.display(),
                    flow.sent()
                );
            }
            Command::Quit => {
                info!("Quit command received, terminating");
                terminate(&self.running, &self.shutdown);
            }
        }
        Ok(())
    }
}

/// Cross-thread handle to a running [`TftpClient`].
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    mode: Arc<Mutex<TransferMode>>,
}

impl ClientHandle {
    /// Never blocks on transfer completion; the command runs whenever
    /// the command loop gets to it.
    pub fn submit(&self, command: Command) -> anyhow::Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| anyhow!("Client is shut down"))
    }

    pub fn terminate(&self) {
        terminate(&self.running, &self.shutdown);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_mode(&self, mode: TransferMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn mode(&self) -> TransferMode {
        *self.mode.lock().unwrap()
    }
}

/// Blocks on the endpoint, decodes datagrams into [`Package`]s and feeds
/// the inbound channel. Malformed datagrams are dropped; a transport
/// error or a shutdown signal ends the loop.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    inbound: mpsc::UnboundedSender<Package>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut buf = [0u8; DATAGRAM_SIZE];
    while running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = shutdown.notified() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((num, addr)) => match TftpPacket::deserialize(&buf[..num]) {
                    Ok(packet) => {
                        if inbound.send(Package { addr, packet }).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed datagram from {addr}: {e}"),
                },
                Err(e) => {
                    warn!("Receive failed: {e}");
                    break;
                }
            },
        }
    }
    terminate(&running, &shutdown);
}

/// Idempotent shutdown: flips the running flag once and leaves a wakeup
/// permit so a receive loop parked in its select observes it.
fn terminate(running: &AtomicBool, shutdown: &Notify) {
    if running.swap(false, Ordering::SeqCst) {
        info!("Terminating");
    }
    shutdown.notify_one();
}
