//! Cast Sender - streams a byte source as encrypted Cast frames
//!
//! Reads stdin or a file, cuts it into fixed-size frames at a fixed frame
//! rate, and sends them to a `cast-receiver`.

use anyhow::Context;
use cast::io::CastSocket;
use cast::protocol::{Dependency, EncodedFrame, RtpTimeDelta, RtpTimeTicks};
use cast::transport::{EnqueueError, Sender, SenderTransport, UdpEnvironment};
use cast_cli::{init_logging, sender_stats_line, Config, SenderConfig};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "cast-sender")]
#[command(about = "Cast Streaming frame sender", long_about = None)]
struct Args {
    /// Configuration file with a [sender] section
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write a matching sender/receiver configuration to this file and exit
    #[arg(long, value_name = "PATH")]
    generate_config: Option<PathBuf>,

    /// Receiver address, overriding the configuration file
    #[arg(short, long)]
    remote: Option<std::net::SocketAddr>,

    /// Input file, '-' for stdin, overriding the configuration file
    #[arg(short, long)]
    input: Option<String>,

    /// Keep running this long after the input ends, for retransmissions
    #[arg(long, default_value = "2")]
    linger_secs: u64,

    /// Verbose output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Longest the loop sleeps waiting for feedback
const MAX_POLL_WAIT: Duration = Duration::from_millis(5);

fn open_input(input: &str) -> anyhow::Result<Box<dyn Read>> {
    if input == "-" {
        tracing::info!("Reading from stdin");
        Ok(Box::new(io::stdin()))
    } else {
        tracing::info!("Reading from {}", input);
        let file = File::open(input).with_context(|| format!("failed to open '{}'", input))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Fill `buffer` as far as the input allows; returns zero at end of input
fn read_frame(reader: &mut dyn Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Some(path) = &args.generate_config {
        let listen = "0.0.0.0:9000".parse()?;
        let remote = args.remote.unwrap_or_else(|| "127.0.0.1:9000".parse().unwrap_or(listen));
        Config::generate(listen, remote)?.to_file(path)?;
        tracing::info!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    let config_path = args
        .config
        .as_ref()
        .context("a configuration file is required (see --generate-config)")?;
    let mut config: SenderConfig = Config::from_file(config_path)?
        .sender
        .context("configuration has no [sender] section")?;
    if let Some(remote) = args.remote {
        config.remote = remote;
    }
    if let Some(input) = &args.input {
        config.input = input.clone();
    }
    config.validate()?;

    run(&config, Duration::from_secs(args.linger_secs))
}

fn run(config: &SenderConfig, linger: Duration) -> anyhow::Result<()> {
    let socket = CastSocket::bind(config.bind)?;
    let feedback_socket = socket.try_clone()?;
    tracing::info!("Sending from {} to {}", socket.local_addr()?, config.remote);

    let transport = SenderTransport::new(UdpEnvironment::new(socket, Some(config.remote)), config.max_bitrate);
    let sender = Sender::new(&transport, &config.session)?;
    let timebase = config.session.rtp_timebase;

    let mut reader = open_input(&config.input)?;
    let mut frame_buffer = vec![0u8; config.frame_size];
    let mut packet_buffer = vec![0u8; transport.max_packet_size()];

    let start = Instant::now();
    let frame_interval = config.frame_interval();
    let mut next_frame_time = start;
    let mut input_ended_at: Option<Instant> = None;
    let mut frames_since_key = 0u32;
    let mut pending_frame: Option<usize> = None;
    let mut next_stats_time = start + config.stats_interval();

    loop {
        let now = Instant::now();

        if input_ended_at.is_none() && now >= next_frame_time {
            let len = match pending_frame.take() {
                Some(len) => len,
                None => read_frame(reader.as_mut(), &mut frame_buffer)?,
            };
            if len == 0 {
                tracing::info!("End of input");
                input_ended_at = Some(now);
            } else {
                let frame_id = sender.next_frame_id();
                let forced_key = config.key_frame_interval > 0 && frames_since_key >= config.key_frame_interval;
                let dependency = if sender.needs_key_frame() || forced_key {
                    Dependency::Key
                } else {
                    Dependency::Dependent
                };
                let referenced = if dependency == Dependency::Key { frame_id } else { frame_id - 1 };
                let rtp_timestamp = RtpTimeTicks::default() + RtpTimeDelta::from_duration(now - start, timebase);
                let frame = EncodedFrame::new(
                    dependency,
                    frame_id,
                    referenced,
                    rtp_timestamp,
                    frame_buffer[..len].to_vec(),
                )
                .with_reference_time(now);

                match sender.enqueue_frame(&frame) {
                    Ok(()) => {
                        frames_since_key = if dependency == Dependency::Key { 0 } else { frames_since_key + 1 };
                    }
                    Err(EnqueueError::PayloadTooLarge) => {
                        anyhow::bail!("frame_size {} is too large to packetize", config.frame_size)
                    }
                    Err(e) => {
                        // Back-pressure: hold the data and try again next frame.
                        tracing::debug!("frame {} deferred: {}", frame_id, e);
                        pending_frame = Some(len);
                    }
                }
            }
            next_frame_time += frame_interval;
        }

        if transport.next_burst_time().map_or(false, |t| t <= now) {
            transport.handle_timeout(now);
        }

        if let Some(ended) = input_ended_at {
            if sender.in_flight_frame_count() == 0 || now >= ended + linger {
                break;
            }
        }

        if now >= next_stats_time && !config.stats_interval().is_zero() {
            tracing::info!("{}", sender_stats_line(&sender.stats(), now - start));
            next_stats_time += config.stats_interval();
        }

        let mut wait = MAX_POLL_WAIT;
        if let Some(t) = transport.next_burst_time() {
            wait = wait.min(t.saturating_duration_since(now));
        }
        if input_ended_at.is_none() {
            wait = wait.min(next_frame_time.saturating_duration_since(now));
        }
        if let Some((len, source)) = feedback_socket.recv_from_timeout(&mut packet_buffer, wait)? {
            if source == config.remote {
                transport.on_received_packet(Instant::now(), &packet_buffer[..len]);
            }
        }
    }

    tracing::info!("{}", sender_stats_line(&sender.stats(), start.elapsed()));
    Ok(())
}
