use std::net::SocketAddr;

use clap::Parser;
use client::{Client, ClientConfig, ClientState};
use log::{info, warn};
use shared::token::{self, ConnectTokenParams};
use shared::{crypto, unix_timestamp, SymmetricKey};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:40000")]
    server: SocketAddr,

    /// Application id shared with the server
    #[arg(long, default_value = "1")]
    app_id: u64,

    /// Seed of the development signing key shared with the server
    #[arg(long, default_value = "7")]
    key_seed: u64,

    /// Client id to put in the connect token (random when omitted)
    #[arg(long)]
    client_id: Option<u64>,

    /// Seconds until the connect token expires
    #[arg(long, default_value = "30")]
    token_lifetime: u64,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Simulated packet loss, 0.0 to 1.0
    #[arg(long, default_value = "0.0")]
    loss: f64,
}

/// Mints a connect token the way a backend would, using the development key.
fn development_token(args: &Args) -> Result<Vec<u8>, shared::TokenError> {
    let signing_key = crypto::development_keys(args.key_seed);
    let now = unix_timestamp();
    let client_to_server_key = SymmetricKey::generate();
    let server_to_client_key = SymmetricKey::generate();
    token::create(
        &ConnectTokenParams {
            application_id: args.app_id,
            creation_time: now,
            expiration_time: now + args.token_lifetime,
            handshake_timeout: 5,
            endpoints: &[args.server],
            client_id: args.client_id.unwrap_or_else(rand::random),
            client_to_server_key: &client_to_server_key,
            server_to_client_key: &server_to_client_key,
            user_data: None,
        },
        &signing_key,
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let mut client = Client::new(ClientConfig {
        application_id: args.app_id,
        ..ClientConfig::default()
    })?;
    if args.fake_ping > 0 || args.loss > 0.0 {
        client.enable_network_simulator(args.fake_ping as f64 / 1000.0, 0.0, args.loss, 0.0);
    }

    let token = development_token(&args)?;
    client.connect(&token, unix_timestamp())?;

    println!("Type a line and press enter to send it; the server echoes it back.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tick = interval(Duration::from_millis(16));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats_tick = interval(Duration::from_secs(5));
    let mut last_update = Instant::now();
    let mut last_state = client.state();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Instant::now();
                let dt = now.duration_since(last_update).as_secs_f64();
                last_update = now;

                client.update(dt, unix_timestamp());
                if client.state() != last_state {
                    last_state = client.state();
                    println!("[{}]", last_state);
                }
                while let Some(message) = client.pop_packet() {
                    println!("< {}", String::from_utf8_lossy(&message));
                }
                if client.state().is_error() || last_state == ClientState::Disconnected {
                    break;
                }
            }
            _ = stats_tick.tick() => {
                if client.is_connected() {
                    let stats = client.network_stats();
                    info!(
                        "rtt avg {:.1} ms, max {:.1} ms, loss {:.1}%",
                        stats.average_rtt(),
                        stats.max_rtt(),
                        stats.average_packet_loss() * 100.0
                    );
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Err(e) = client.send(line.as_bytes(), true) {
                            warn!("Not sent: {}", e);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, disconnecting");
                break;
            }
        }
    }

    client.disconnect();
    Ok(())
}
