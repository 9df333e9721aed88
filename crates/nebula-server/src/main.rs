//! Command-line host for nebula-link sessions.
//!
//! `serve` runs a server that answers pings, `connect` joins a server and
//! measures round trips, `discover` lists servers on the local network.

use std::error::Error;
use std::io::BufRead;
use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use nebula_config::{CliArgs, Config};
use nebula_link::messages::{Ping, Pong};
use nebula_link::{
    Client, ConnectionEvent, Envelope, Message, MessageKind, Server, SessionConfig, TlsContext, TransportFault,
};
use tracing::{error, info, warn};

type AppResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser, Debug)]
#[command(name = "nebula-server", about = "Run or probe nebula-link sessions")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept clients until stdin closes or `quit` is entered.
    Serve {
        /// Stop after this many seconds instead of waiting on stdin.
        #[arg(long)]
        for_secs: Option<u64>,
    },
    /// Join a server, exchange pings, then leave.
    Connect {
        #[arg(long, default_value_t = 5)]
        pings: u32,
    },
    /// List servers answering on the datagram port.
    Discover,
}

fn load_config(args: &CliArgs) -> Config {
    let dir = args.config.clone().or_else(Config::default_dir);
    let mut config = match dir {
        Some(dir) => Config::load_or_create(&dir).unwrap_or_else(|e| {
            eprintln!("Using default config: {e}");
            Config::default()
        }),
        None => Config::default(),
    };
    config.apply_cli_overrides(args);
    config
}

fn session_config(config: &Config, server: bool) -> AppResult<SessionConfig> {
    let tls = if config.tls.enabled {
        let context = if server {
            let (cert, key) = config.tls.server_paths()?;
            TlsContext::server_from_pem(cert, key)?
        } else {
            TlsContext::client_from_pem(config.tls.client_ca()?, &config.tls.server_name)?
        };
        Some(context)
    } else {
        None
    };

    let network = &config.network;
    Ok(SessionConfig {
        label: network.label.clone(),
        game_name: network.game_name.clone(),
        version: network.version,
        loop_delay: Duration::from_millis(network.loop_delay_ms),
        stream_capacity: network.stream_buffer,
        datagram_capacity: network.datagram_buffer,
        connector_idle: Duration::from_millis(network.connector_idle_ms),
        tls,
    })
}

fn serve(config: &Config, for_secs: Option<u64>) -> AppResult<()> {
    let ip: IpAddr = config.network.host.parse()?;
    let server = Server::bind_addr(
        session_config(config, true)?,
        ip,
        config.network.stream_port,
        config.network.datagram_port,
    )?;

    server
        .listeners()
        .add_connection_listener(|event: &ConnectionEvent| match event {
            ConnectionEvent::Connected(peer) => {
                info!("{} joined as player {}", peer.label(), peer.player_id())
            }
            ConnectionEvent::Disconnected(Some(peer)) => info!("{} left", peer.label()),
            ConnectionEvent::Disconnected(None) => {}
        });
    server.listeners().add_error_listener(|fault: &TransportFault| {
        let peer = fault.peer.as_ref().map_or("-", |peer| peer.label());
        warn!("{:?} fault on {peer}: {}", fault.leg, fault.reason);
    });
    server
        .listeners()
        .add_message_listener_for(MessageKind::Ping, |envelope: &Envelope| {
            let (Message::Ping(ping), Some(source)) = (&envelope.message, &envelope.source) else {
                return;
            };
            let pong = Message::Pong(Pong {
                seq: ping.seq,
                timestamp_ms: ping.timestamp_ms,
            });
            let reply = if envelope.reliable {
                Envelope::reliable(pong)
            } else {
                Envelope::unreliable(pong)
            };
            if let Err(e) = source.send(reply) {
                warn!("Pong to {} failed: {e}", source.label());
            }
        });
    server.start()?;
    info!(
        "Serving on stream {:?}, datagram {:?}",
        server.stream_addr(),
        server.datagram_addr()
    );

    match for_secs {
        Some(secs) => std::thread::sleep(Duration::from_secs(secs)),
        None => {
            for line in std::io::stdin().lock().lines() {
                if line?.trim() == "quit" {
                    break;
                }
            }
        }
    }

    server.stop(None)?;
    Ok(())
}

fn connect(config: &Config, pings: u32) -> AppResult<()> {
    let client = Client::connect(
        session_config(config, false)?,
        &config.network.host,
        config.network.stream_port,
        config.network.datagram_port,
    )?;

    let started = Instant::now();
    let pongs = Arc::new(AtomicU32::new(0));
    let counter = pongs.clone();
    client
        .listeners()
        .add_message_listener_for(MessageKind::Pong, move |envelope: &Envelope| {
            if let Message::Pong(pong) = &envelope.message {
                let now = started.elapsed().as_millis() as u64;
                info!("Pong {} after {} ms", pong.seq, now.saturating_sub(pong.timestamp_ms));
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
    client.listeners().add_error_listener(|fault: &TransportFault| {
        warn!("{:?} fault: {}", fault.leg, fault.reason);
    });
    client
        .listeners()
        .add_message_listener_for(MessageKind::Disconnect, |envelope: &Envelope| {
            if let Message::Disconnect(notice) = &envelope.message {
                warn!("Server closed the session: {:?}", notice.reason);
            }
        });
    client.start()?;

    let deadline = Instant::now() + Duration::from_secs(10);
    while !client.is_registered() {
        let refused = !client.is_connected() && started.elapsed() > Duration::from_secs(1);
        if Instant::now() >= deadline || refused {
            client.disconnect()?;
            return Err("server did not accept the registration".into());
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    info!("Registered as player {}", client.player_id());

    for seq in 0..pings {
        let ping = Message::Ping(Ping {
            seq,
            timestamp_ms: started.elapsed().as_millis() as u64,
        });
        client.send(Envelope::reliable(ping))?;
        std::thread::sleep(Duration::from_millis(100));
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while pongs.load(Ordering::Relaxed) < pings && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    info!("Received {}/{pings} pongs", pongs.load(Ordering::Relaxed));

    client.disconnect()?;
    Ok(())
}

fn discover(config: &Config) -> AppResult<()> {
    let port = u16::try_from(config.network.datagram_port)
        .map_err(|_| format!("invalid datagram port {}", config.network.datagram_port))?;
    let timeout = Duration::from_millis(config.network.discovery_timeout_ms);
    let hosts = Client::discover_hosts(port, timeout)?;
    if hosts.is_empty() {
        println!("No servers found on port {port}");
    }
    for host in hosts {
        println!("{host}");
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = load_config(&cli.args);
    nebula_log::init_logging(config.debug.log_dir.as_deref(), cfg!(debug_assertions), Some(&config));

    let result = match cli.command {
        Command::Serve { for_secs } => serve(&config, for_secs),
        Command::Connect { pings } => connect(&config, pings),
        Command::Discover => discover(&config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
