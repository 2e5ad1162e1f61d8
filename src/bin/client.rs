use std::time;

use clap::Parser;

/// Sends messages to an echo server and waits for each reply.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Address of the server to connect to.
    #[arg(short, long, default_value = "127.0.0.1:8888")]
    server: String,

    /// Number of messages to send.
    #[arg(short, long, default_value_t = 10)]
    count: usize,

    /// Time to wait for each reply, in milliseconds.
    #[arg(short, long, default_value_t = 1000)]
    timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let event_loop = piu::EventLoop::start()?;

    let session = event_loop.connect(args.server.as_str())?;

    tracing::info!(server = %session.peer_addr(), local = %session.local_addr(), "connected");

    let timeout = time::Duration::from_millis(args.timeout_ms);
    let mut buf = vec![0u8; 65_536];

    for i in 0..args.count {
        let message = format!("message {i}");

        session.send(message.as_bytes())?;

        match session.recv_timeout(&mut buf, timeout)? {
            Some(len) => {
                println!("{}", String::from_utf8_lossy(&buf[..len]));
            }
            None => {
                tracing::warn!(index = i, "no reply after {}ms", args.timeout_ms);
            }
        }
    }

    session.close();
    event_loop.stop()?;

    Ok(())
}
