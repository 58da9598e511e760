use clap::Parser;
use log::{info, warn};
use server::{Server, ServerConfig, ServerEvent};
use shared::{crypto, unix_timestamp};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

/// Echo server for the secure connection protocol.
/// Every message a client sends is sent straight back to it on the same channel.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "40000")]
        port: u16,
        /// Maximum number of connected clients
        #[clap(short, long, default_value = "64")]
        max_clients: usize,
        /// Application id connect tokens must carry
        #[clap(long, default_value = "1")]
        app_id: u64,
        /// Seed of the development signing key shared with the demo client
        #[clap(long, default_value = "7")]
        key_seed: u64,
        /// Tick rate (updates per second)
        #[clap(short, long, default_value = "60")]
        tick_rate: u32,
        /// Simulated one-way latency in milliseconds
        #[clap(long, default_value = "0")]
        latency_ms: u32,
        /// Simulated packet loss, 0.0 to 1.0
        #[clap(long, default_value = "0.0")]
        loss: f64,
    }

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Hint: set RUST_LOG=info (or debug) to see connection logs");
    }
    env_logger::init();

    let args = Args::parse();

    let signing_key = crypto::development_keys(args.key_seed);
    let config = ServerConfig::new(args.app_id, signing_key.verifying_key(), signing_key)
        .with_max_clients(args.max_clients);

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::start(address.as_str(), config)?;
    if args.latency_ms > 0 || args.loss > 0.0 {
        server.enable_network_simulator(args.latency_ms as f64 / 1000.0, 0.0, args.loss, 0.0);
    }

    let mut tick = interval(Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_update = Instant::now();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Instant::now();
                let dt = now.duration_since(last_update).as_secs_f64();
                last_update = now;

                server.update(dt, unix_timestamp());
                echo_events(&mut server);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    server.stop();
    Ok(())
}

/// Logs connection events and echoes every payload back to its sender.
fn echo_events(server: &mut Server) {
    while let Some(event) = server.poll_event() {
        match event {
            ServerEvent::NewConnection {
                handle,
                client_id,
                endpoint,
                ..
            } => {
                info!(
                    "Client {} joined from {} (id {:#x}), {} connected",
                    handle,
                    endpoint,
                    client_id,
                    server.client_count()
                );
            }
            ServerEvent::PayloadPacket { handle, data } => {
                if let Err(e) = server.send(handle, &data, true) {
                    warn!("Failed to echo {} bytes to {}: {}", data.len(), handle, e);
                }
            }
            ServerEvent::Disconnected { handle } => {
                info!("Client {} left, {} connected", handle, server.client_count());
            }
        }
    }
}
