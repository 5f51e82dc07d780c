use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, Level};

use rudp::file_transfer;
use rudp::{Connection, Listener, RudpConfig};

/// Reliable-datagram server: receives files (default) or chats interactively
/// with one client at a time.
#[derive(Parser)]
#[command(name = "rudp-server")]
struct Args {
    /// UDP port to listen on
    port: u16,

    /// Interactive chat instead of file receive
    #[arg(long)]
    chat: bool,

    /// Probability in [0, 1] of dropping each received datagram
    #[arg(long, default_value_t = 0.0)]
    loss_rate: f64,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[arg(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).try_init().ok();

    let config = RudpConfig {
        loss_rate: args.loss_rate,
        ..RudpConfig::default()
    };
    config.validate()?;

    let mut listener = Listener::bind(args.port, config).await?;
    info!("serving on port {}", args.port);

    loop {
        let mut conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept failed, shutting down: {}", e);
                break;
            }
        };

        let session = if args.chat {
            run_chat(&mut conn).await
        } else {
            receive_file(&mut conn).await
        };
        if let Err(e) = session {
            error!("session ended with error: {}", e);
        }

        if let Err(e) = conn.close().await {
            error!("close failed: {}", e);
        }
    }

    Ok(())
}

async fn receive_file(conn: &mut Connection) -> anyhow::Result<()> {
    let received = file_transfer::recv_file(conn).await?;
    println!("Received '{}' ({} bytes)", received.name, received.len);
    println!("SHA256: {}", received.digest);
    Ok(())
}

async fn run_chat(conn: &mut Connection) -> anyhow::Result<()> {
    println!("[CHAT] Client connected, starting interactive chat session");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line == "/quit" {
                    println!("[CHAT] Server initiating chat termination...");
                    conn.send(b"/quit").await?;
                    break;
                }
                if !line.is_empty() {
                    println!("[YOU]: {line}");
                    conn.send(line.as_bytes()).await?;
                }
            }
            received = conn.recv(&mut buf) => {
                let n = received?;
                if n == 0 {
                    continue;
                }
                let message = String::from_utf8_lossy(&buf[..n]);
                if message == "/quit" {
                    println!("[CHAT] Client requested to quit");
                    break;
                }
                println!("[Client]: {message}");
            }
        }
    }

    println!("[CHAT] Chat session ended");
    Ok(())
}
