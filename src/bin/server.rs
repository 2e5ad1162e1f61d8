use std::thread;

use clap::Parser;

/// Echo server: every message received on a session is sent back on it.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Local address to bind.
    #[arg(short, long, default_value = "127.0.0.1:8888")]
    bind: String,
}

fn echo(session: piu::Session) {
    let mut buf = vec![0u8; 65_536];

    loop {
        let len = match session.recv(&mut buf) {
            Ok(len) => len,
            Err(err) => {
                tracing::info!(peer = %session.peer_addr(), error = %err, "echo finished");
                return;
            }
        };

        tracing::info!(peer = %session.peer_addr(), len, "echoing message");

        if let Err(err) = session.send(&buf[..len]) {
            tracing::warn!(peer = %session.peer_addr(), error = %err, "failed to echo message");
        }
    }
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

    let server = event_loop.bind(args.bind.as_str())?;

    tracing::info!(local = %server.local_addr(), "listening");

    loop {
        let session = server.accept()?;

        tracing::info!(peer = %session.peer_addr(), "accepted");

        thread::spawn(move || echo(session));
    }
}
