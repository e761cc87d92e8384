use anyhow::bail;
use clap::Parser;
use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::time::Duration;

use tftpc::Cli;
use tftpc::{ClientHandle, Command, TftpClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Cli::parse();

    let server = SocketAddr::new(args.host, args.port);
    let mut client = TftpClient::new(
        server,
        args.mode,
        Duration::from_millis(args.timeout),
        args.retry,
    );
    client.connect().await?;

    // stdin is blocking, so the prompt gets its own thread; commands
    // cross over through the client handle.
    let handle = client.handle();
    std::thread::spawn(move || prompt_loop(handle));

    client.run().await
}

fn prompt_loop(client: ClientHandle) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if !client.is_running() {
            break;
        }
        match dispatch(&client, line.trim()) {
            Ok(keep_reading) => {
                if !keep_reading {
                    break;
                }
            }
            Err(e) => println!("{e}"),
        }
    }
}

/// Maps one prompt line to a command. Returns `false` once the prompt
/// should stop reading.
fn dispatch(client: &ClientHandle, line: &str) -> anyhow::Result<bool> {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("get") => {
            let Some(remote) = words.next() else {
                bail!("Usage: get <remote-file> [local-file]");
            };
            let local = words.next().unwrap_or(remote);
            client.submit(Command::Get {
                remote: remote.to_string(),
                local: PathBuf::from(local),
            })?;
        }
        Some("put") => {
            let Some(local) = words.next() else {
                bail!("Usage: put <local-file> [remote-file]");
            };
            let remote = words.next().unwrap_or(local);
            client.submit(Command::Put {
                local: PathBuf::from(local),
                remote: remote.to_string(),
            })?;
        }
        Some("mode") => match words.next() {
            Some(word) => client.set_mode(word.parse()?),
            None => println!("mode: {}", client.mode()),
        },
        Some("quit") => {
            client.submit(Command::Quit)?;
            return Ok(false);
        }
        _ => {
            println!("Commands: get <remote> [local], put <local> [remote], mode [netascii|octet], quit");
        }
    }
    Ok(true)
}
