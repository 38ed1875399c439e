//! Cast Receiver - receives Cast frames and writes their payloads out
//!
//! Listens for one `cast-sender` stream, reassembles and decrypts frames, and
//! writes them in order to stdout or a file.

use anyhow::Context;
use cast::io::CastSocket;
use cast::transport::{Receiver, UdpEnvironment};
use cast_cli::{init_logging, receiver_stats_line, Config, ReceiverConfig};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "cast-receiver")]
#[command(about = "Cast Streaming frame receiver", long_about = None)]
struct Args {
    /// Configuration file with a [receiver] section
    #[arg(short, long)]
    config: PathBuf,

    /// Listen address, overriding the configuration file
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Output file, '-' for stdout, overriding the configuration file
    #[arg(short, long)]
    output: Option<String>,

    /// Exit after this many seconds without any packet; zero waits forever
    #[arg(long, default_value = "0")]
    idle_timeout_secs: u64,

    /// Verbose output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

const MAX_POLL_WAIT: Duration = Duration::from_millis(50);

fn open_output(output: &str) -> anyhow::Result<Box<dyn Write>> {
    if output == "-" {
        tracing::info!("Writing to stdout");
        Ok(Box::new(io::stdout()))
    } else {
        tracing::info!("Writing to {}", output);
        let file = File::create(output).with_context(|| format!("failed to create '{}'", output))?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config: ReceiverConfig = Config::from_file(&args.config)?
        .receiver
        .context("configuration has no [receiver] section")?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(output) = &args.output {
        config.output = output.clone();
    }

    let idle_timeout = (args.idle_timeout_secs > 0).then(|| Duration::from_secs(args.idle_timeout_secs));
    run(&config, idle_timeout)
}

fn run(config: &ReceiverConfig, idle_timeout: Option<Duration>) -> anyhow::Result<()> {
    let socket = CastSocket::bind(config.listen)?;
    let inbound = socket.try_clone()?;
    tracing::info!("Listening on {}", socket.local_addr()?);

    let mut receiver = Receiver::new(UdpEnvironment::new(socket, None), &config.session)?;
    let mut writer = open_output(&config.output)?;
    let mut buffer = vec![0u8; 2048];

    let start = Instant::now();
    let mut last_packet_time = start;
    let mut next_stats_time = start + config.stats_interval();

    loop {
        let now = Instant::now();
        let wait = receiver
            .next_timeout()
            .map_or(MAX_POLL_WAIT, |t| t.saturating_duration_since(now).min(MAX_POLL_WAIT));

        if let Some((len, source)) = inbound.recv_from_timeout(&mut buffer, wait)? {
            let arrival = Instant::now();
            if receiver.on_received_packet(source, arrival, &buffer[..len]) {
                if receiver.remote_endpoint() == Some(source) && last_packet_time == start {
                    tracing::info!("Receiving from {}", source);
                }
                last_packet_time = arrival;
            }
        }

        let now = Instant::now();
        if receiver.next_timeout().map_or(false, |t| t <= now) {
            receiver.handle_timeout(now);
        }

        let mut wrote = false;
        while let Some(frame) = receiver.take_frame() {
            writer.write_all(&frame.data)?;
            wrote = true;
        }
        if wrote {
            writer.flush()?;
        }

        if now >= next_stats_time && !config.stats_interval().is_zero() {
            tracing::info!("{}", receiver_stats_line(&receiver.stats(), now - start));
            next_stats_time += config.stats_interval();
        }

        if let Some(timeout) = idle_timeout {
            if now.saturating_duration_since(last_packet_time) >= timeout {
                tracing::info!("No packets for {:?}, exiting", timeout);
                break;
            }
        }
    }

    writer.flush()?;
    tracing::info!("{}", receiver_stats_line(&receiver.stats(), start.elapsed()));
    Ok(())
}
