//! ironike CLI — IKEv1 keying daemon and control client

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ironike_engine::control::{ControlCommand, ControlNotify};
use ironike_engine::daemon::Daemon;
use ironike_engine::events::LogSink;
use ironike_engine::pfkey::LoopbackGateway;
use ironike_engine::{Engine, EngineConfig};

/// ironike — an IKEv1 keying daemon
#[derive(Parser)]
#[command(name = "ironike")]
#[command(version)]
#[command(about = "IKEv1 session and negotiation daemon", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the keying daemon
    Up {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Validate a configuration file
    Check {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Ask a running daemon to negotiate toward a peer
    Connect {
        /// Peer address, e.g. 203.0.113.7:500
        remote: SocketAddr,

        /// Control socket address
        #[arg(long, default_value = "127.0.0.1:7791")]
        control: SocketAddr,

        /// Seconds to wait for the outcome
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },

    /// Tear a peer's session down
    Disconnect {
        remote: SocketAddr,

        #[arg(long, default_value = "127.0.0.1:7791")]
        control: SocketAddr,
    },

    /// Show live sessions
    Status {
        #[arg(long, default_value = "127.0.0.1:7791")]
        control: SocketAddr,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Generate a pre-shared secret (base64)
    Genpsk,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Up { config } => cmd_up(&config),
        Commands::Check { config } => cmd_check(&config),
        Commands::Connect {
            remote,
            control,
            wait,
        } => cmd_connect(remote, control, wait),
        Commands::Disconnect { remote, control } => {
            send_command(control, &ControlCommand::Disconnect { remote })?;
            println!("disconnect requested for {}", remote);
            Ok(())
        }
        Commands::Status { control, json } => cmd_status(control, json),
        Commands::Genpsk => {
            let psk = ironike_proto::select_backend().nonce(32);
            println!("{}", base64::encode(psk));
            Ok(())
        }
    }
}

fn cmd_up(config_path: &PathBuf) -> Result<()> {
    let cfg = EngineConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    tracing::info!(
        listen = %cfg.listen,
        control = %cfg.control,
        peers = cfg.peers.len(),
        "starting ironike"
    );
    // The kernel SADB attachment is platform integration work; the
    // loopback gateway acknowledges SA operations locally.
    tracing::warn!("using loopback SADB gateway (no kernel attachment)");

    let engine = Engine::new(
        cfg,
        ironike_proto::select_backend(),
        Box::new(LoopbackGateway::new()),
        Box::new(LogSink),
    );
    let mut daemon = Daemon::new(engine);
    daemon.init().context("binding sockets")?;

    install_signal_handlers(&daemon);
    daemon.run().context("event loop")?;
    Ok(())
}

#[cfg(unix)]
fn install_signal_handlers(daemon: &Daemon) {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, OnceLock};

    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    extern "C" fn on_terminate(_sig: libc::c_int) {
        if let Some(flag) = FLAG.get() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    let _ = FLAG.set(daemon.shutdown_flag());
    unsafe {
        libc::signal(libc::SIGINT, on_terminate as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_terminate as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers(_daemon: &Daemon) {}

fn cmd_check(config_path: &PathBuf) -> Result<()> {
    let cfg = EngineConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    println!(
        "ok: listen {}, control {}, {} peer(s)",
        cfg.listen,
        cfg.control,
        cfg.peers.len()
    );
    for peer in &cfg.peers {
        println!(
            "  peer {} mode={:?} dpd={} idle={}",
            peer.remote,
            peer.config.exchange_mode,
            peer.config.dpd.is_some(),
            peer.config.idle.is_some(),
        );
    }
    Ok(())
}

fn send_command(control: SocketAddr, cmd: &ControlCommand) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(control)
        .with_context(|| format!("connecting to control socket {}", control))?;
    let line = serde_json::to_string(cmd)?;
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(stream)
}

fn cmd_connect(remote: SocketAddr, control: SocketAddr, wait: u64) -> Result<()> {
    let stream = send_command(control, &ControlCommand::Connect { remote })?;
    stream.set_read_timeout(Some(Duration::from_secs(wait)))?;
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break, // timeout or disconnect
        };
        let notify: ControlNotify = match serde_json::from_str(&line) {
            Ok(n) => n,
            Err(_) => continue,
        };
        match notify {
            ControlNotify::PhaseEstablished {
                phase,
                remote: r,
                rekey,
            } if r == remote => {
                println!("{:?} established with {} (rekey: {})", phase, r, rekey);
                return Ok(());
            }
            ControlNotify::NeedAuthinfo { remote: r } if r == remote => {
                println!("peer {} requires XAUTH credentials", r);
            }
            ControlNotify::IkeFailed {
                remote: r,
                code,
                reason,
            } if r == remote => {
                anyhow::bail!("negotiation failed ({:?}): {}", code, reason);
            }
            _ => {}
        }
    }
    anyhow::bail!("no outcome within {}s", wait)
}

fn cmd_status(control: SocketAddr, json: bool) -> Result<()> {
    let stream = send_command(control, &ControlCommand::Status)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = line.context("reading status reply")?;
        if let Ok(ControlNotify::Status { sessions }) = serde_json::from_str(&line) {
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("no sessions");
            } else {
                for s in sessions {
                    println!(
                        "{} -> {}  established={} client={} floated={} ph1={} ph2={}",
                        s.local,
                        s.remote,
                        s.established,
                        s.is_client,
                        s.ports_floated,
                        s.active_phase1,
                        s.active_phase2,
                    );
                }
            }
            return Ok(());
        }
    }
    anyhow::bail!("no status reply")
}
