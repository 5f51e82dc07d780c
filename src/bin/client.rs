use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, Level};

use rudp::file_transfer;
use rudp::{Connection, RudpConfig};

/// Reliable-datagram client: sends a file (default) or chats interactively
/// with the server.
#[derive(Parser)]
#[command(name = "rudp-client")]
struct Args {
    /// Server hostname or address
    host: String,

    /// Server UDP port
    port: u16,

    /// Local file to send (file-transfer mode)
    #[arg(required_unless_present = "chat")]
    input_file: Option<PathBuf>,

    /// Name to store the file under on the server (file-transfer mode)
    #[arg(required_unless_present = "chat")]
    output_name: Option<String>,

    /// Interactive chat instead of file transfer
    #[arg(long, conflicts_with_all = ["input_file", "output_name"])]
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

    let mut conn = Connection::connect(&args.host, args.port, config).await?;

    let result = if args.chat {
        run_chat(&mut conn).await
    } else {
        // clap guarantees both are present outside chat mode
        let (Some(input_file), Some(output_name)) = (&args.input_file, &args.output_name) else {
            anyhow::bail!("file-transfer mode needs an input file and an output name");
        };
        send_file(&mut conn, input_file, output_name).await
    };

    if let Err(e) = conn.close().await {
        error!("close failed: {}", e);
    }
    result
}

async fn send_file(
    conn: &mut Connection,
    input_file: &PathBuf,
    output_name: &str,
) -> anyhow::Result<()> {
    println!("Sending file '{}' to be saved as '{}'", input_file.display(), output_name);
    let sent = file_transfer::send_file(conn, input_file, output_name).await?;
    println!("Sent {sent} bytes");
    Ok(())
}

async fn run_chat(conn: &mut Connection) -> anyhow::Result<()> {
    println!("Type messages to send. Type '/quit' to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line == "/quit" {
                    println!("[CHAT] Initiating chat termination...");
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
                    println!("[CHAT] Server disconnected");
                    break;
                }
                println!("[Server]: {message}");
            }
        }
    }

    Ok(())
}
