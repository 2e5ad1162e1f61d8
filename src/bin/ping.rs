use std::io;
use std::net;
use std::thread;
use std::time;

use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};

/// Sends a burst of identical random messages over loopback and reports how many arrived intact,
/// either over raw UDP or over a PIU session.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Transport to measure.
    #[arg(value_enum, default_value_t = Transport::Piu)]
    transport: Transport,

    /// Loopback port for the receiving side.
    #[arg(short, long, default_value_t = 8888)]
    port: u16,

    /// Number of messages to send.
    #[arg(short = 'n', long, default_value_t = 10)]
    count: usize,

    /// Size of each message in bytes.
    #[arg(short, long, default_value_t = 2048)]
    size: usize,

    /// Seed for the message contents. Random if not given.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Transport {
    Udp,
    Piu,
}

// Time to wait for each message before counting it as lost
const RECV_TIMEOUT: time::Duration = time::Duration::from_millis(100);

// Largest payload a single datagram can carry after the packet header
const MESSAGE_SIZE_MAX: usize = 65_498;

struct Report {
    received: usize,
    intact: usize,
}

fn random_message(size: usize, seed: Option<u64>) -> Vec<u8> {
    let mut rng = match seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_entropy(),
    };

    let mut message = vec![0u8; size];
    rng.fill(&mut message[..]);
    message
}

fn udp_ping(args: &Args, message: &[u8]) -> io::Result<Report> {
    let receiver = net::UdpSocket::bind((net::Ipv4Addr::LOCALHOST, args.port))?;
    receiver.set_read_timeout(Some(RECV_TIMEOUT))?;

    let sender = net::UdpSocket::bind((net::Ipv4Addr::LOCALHOST, 0))?;

    for _ in 0..args.count {
        sender.send_to(message, receiver.local_addr()?)?;
    }

    let expected = md5::compute(message);
    let mut buf = vec![0u8; message.len()];
    let mut report = Report { received: 0, intact: 0 };

    for i in 0..args.count {
        match receiver.recv_from(&mut buf) {
            Ok((len, _)) => {
                report.received += 1;

                if md5::compute(&buf[..len]) == expected {
                    report.intact += 1;
                }

                println!("Packet {}: Received", i + 1);
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                println!("Packet {}: Packet was lost", i + 1);
            }
            Err(err) => return Err(err),
        }
    }

    Ok(report)
}

fn piu_ping(args: &Args, message: &[u8]) -> piu::Result<Report> {
    let config = piu::Config {
        payload_size_max: message.len().max(1),
        ..Default::default()
    };

    let event_loop = piu::EventLoop::start_with_config(config)?;

    let server = event_loop.bind((net::Ipv4Addr::LOCALHOST, args.port))?;
    let server_addr = server.local_addr();

    let (receiver, sender) = thread::scope(|scope| {
        let connecting = scope.spawn(|| event_loop.connect(server_addr));

        let receiver = server.accept();
        let sender = connecting.join().expect("connecting thread panicked");

        (receiver, sender)
    });

    let receiver = receiver?;
    let sender = sender?;

    server.close();

    for _ in 0..args.count {
        sender.send(message)?;
    }

    let expected = md5::compute(message);
    let mut buf = vec![0u8; message.len()];
    let mut report = Report { received: 0, intact: 0 };

    for i in 0..args.count {
        match receiver.recv_timeout(&mut buf, RECV_TIMEOUT)? {
            Some(len) => {
                report.received += 1;

                if md5::compute(&buf[..len]) == expected {
                    report.intact += 1;
                }

                println!("Packet {}: Received", i + 1);
            }
            None => {
                println!("Packet {}: Packet was lost", i + 1);
            }
        }
    }

    sender.close();
    receiver.close();
    event_loop.stop()?;

    Ok(report)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    if args.count == 0 {
        return Err("count must be at least 1".into());
    }

    if args.size > MESSAGE_SIZE_MAX {
        return Err(format!("size must be at most {MESSAGE_SIZE_MAX}").into());
    }

    let message = random_message(args.size, args.seed);

    println!("Message digest: {:x}", md5::compute(&message));

    let report = match args.transport {
        Transport::Udp => udp_ping(&args, &message)?,
        Transport::Piu => piu_ping(&args, &message)?,
    };

    let lost = args.count - report.received;

    println!("Packets received: {}/{}", report.received, args.count);
    println!("Packets intact: {}/{}", report.intact, report.received);
    println!("Loss: {:.2}%", 100.0 * lost as f64 / args.count as f64);

    Ok(())
}
