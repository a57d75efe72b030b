//! Entry point for `reliable-udp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  All protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing) and the
//! stdin/stdout plumbing.

use std::io;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reliable_udp::{Config, Endpoint, Mode, Stream};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reliable byte stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept connections and print what each peer sends.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        #[command(flatten)]
        protocol: ProtocolArgs,
    },
    /// Send stdin to a server and print its replies.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Local address to bind.
        #[arg(long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
        #[command(flatten)]
        protocol: ProtocolArgs,
    },
}

#[derive(Args)]
struct ProtocolArgs {
    /// Sliding-window size in packets.
    #[arg(short, long, default_value_t = 1)]
    window: u32,
    /// Retransmission timeout in milliseconds.
    #[arg(short, long, default_value_t = 2000)]
    timeout: u64,
}

impl ProtocolArgs {
    fn config(&self) -> Config {
        Config::new(self.window, self.timeout)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Command::Server { bind, protocol } => server(bind, protocol.config()).await,
        Command::Client {
            server,
            bind,
            protocol,
        } => {
            client(bind, server, protocol.config()).await?;
            // The stdin reader may still be parked in a blocking read.
            std::process::exit(0);
        }
    }
}

async fn server(bind: SocketAddr, config: Config) -> Result<()> {
    let mut endpoint = Endpoint::bind(bind, config, Mode::Server)
        .await
        .with_context(|| format!("binding {bind}"))?;
    log::info!("Starting server on {}", endpoint.local_addr()?);
    let mut incoming = endpoint
        .incoming()
        .context("incoming stream receiver already taken")?;
    let driver = tokio::spawn(endpoint.run());

    loop {
        tokio::select! {
            accepted = incoming.recv() => {
                let Some(stream) = accepted else { break };
                tokio::spawn(serve(stream));
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted; shutting down");
                break;
            }
        }
    }
    driver.abort();
    Ok(())
}

/// Print everything the peer sends, then close our half.
async fn serve(mut stream: Stream) {
    let peer = stream.peer();
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = stream.recv().await {
        if let Err(e) = emit(&mut stdout, &chunk).await {
            log::warn!("{peer}: stdout write failed: {e}");
        }
    }
    if let Err(e) = stream.finish() {
        log::warn!("{peer}: {e}");
    }
}

/// Write one delivered chunk and flush it through.
async fn emit<W: AsyncWrite + Unpin>(out: &mut W, chunk: &[u8]) -> io::Result<()> {
    out.write_all(chunk).await?;
    out.flush().await
}

async fn client(bind: SocketAddr, server: SocketAddr, config: Config) -> Result<()> {
    let mut endpoint = Endpoint::bind(bind, config, Mode::Client)
        .await
        .with_context(|| format!("binding {bind}"))?;
    log::info!("Starting client, connecting to {server}");
    let mut stream = endpoint
        .connect(server)
        .with_context(|| format!("connecting to {server}"))?;
    let driver = tokio::spawn(endpoint.run());

    let peer = stream.peer();

    let (chunk_tx, mut chunk_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if chunk_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("stdin read failed: {e}");
                    break;
                }
            }
        }
    });

    // stdin → peer and peer → stdout until both directions are done.
    let mut stdout = tokio::io::stdout();
    let (mut sending, mut receiving) = (true, true);
    while sending || receiving {
        tokio::select! {
            chunk = chunk_rx.recv(), if sending => match chunk {
                Some(chunk) => stream.write(&chunk)?,
                None => {
                    stream.finish()?;
                    sending = false;
                }
            },
            delivered = stream.recv(), if receiving => match delivered {
                Some(chunk) => emit(&mut stdout, &chunk).await?,
                None => receiving = false,
            },
        }
    }

    driver
        .await
        .context("endpoint task panicked")?
        .with_context(|| format!("session with {peer}"))?;
    Ok(())
}
