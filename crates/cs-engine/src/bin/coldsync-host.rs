//! `coldsync-host`: the thin CLI surface around [`cs_engine::SyncEngine`].
//!
//! Argument parsing, the config-file grammar, and the registry file are
//! external collaborators; this binary only wires their already-
//! parsed results (or, absent a real parser, a handful of flags and an
//! empty conduit list) into the engine. It exists so the workspace has a
//! runnable entry point, not a fully featured command-line tool.

use std::net::{IpAddr, UdpSocket};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use cs_core::HostIdentity;
use cs_engine::{BackupMode, Outcome, SyncConfig, SyncEngine};
use cs_proto::{TcpTransport, Transport, DEFAULT_NEGOTIATED_RATE};
#[cfg(unix)]
use cs_proto::{SerialTransport, UsbTransport};

#[cfg(unix)]
mod cancel_signal {
    use std::sync::OnceLock;

    use nix::sys::signal::{self, SigHandler, Signal};

    use cs_core::CancelFlag;

    static CANCEL_FLAG: OnceLock<CancelFlag> = OnceLock::new();

    extern "C" fn request_cancel(_signum: i32) {
        if let Some(flag) = CANCEL_FLAG.get() {
            flag.set();
        }
    }

    /// Installs SIGINT/SIGTERM handlers that set `flag` instead of killing
    /// the process outright, so a Ctrl-C mid-sync takes the orderly
    /// `CancelledByUser` path (conduit teardown, `close_db(all)`,
    /// `end_of_sync(cancelled)`) rather than an abrupt abort.
    pub fn install(flag: CancelFlag) {
        CANCEL_FLAG.set(flag).unwrap_or_else(|_| panic!("cancel handler installed twice"));
        let handler = SigHandler::Handler(request_cancel);
        unsafe {
            signal::sigaction(Signal::SIGINT, &signal::SigAction::new(handler, signal::SaFlags::empty(), signal::SigSet::empty()))
                .expect("install SIGINT handler");
            signal::sigaction(Signal::SIGTERM, &signal::SigAction::new(handler, signal::SaFlags::empty(), signal::SigSet::empty()))
                .expect("install SIGTERM handler");
        }
    }
}

#[cfg(not(unix))]
mod cancel_signal {
    use cs_core::CancelFlag;

    pub fn install(_flag: CancelFlag) {}
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Link {
    Serial,
    Usb,
    Tcp,
}

/// Run one HotSync against a handheld device.
#[derive(Debug, Parser)]
#[command(name = "coldsync-host", version, about)]
struct Cli {
    /// Transport family to use for this sync.
    #[arg(long, value_enum, default_value_t = Link::Serial)]
    link: Link,

    /// Device path for `--link serial`/`--link usb` (e.g. /dev/ttyUSB1), or
    /// the peer's IPv4 address for `--link tcp`.
    #[arg(long)]
    device: Option<String>,

    /// Base directory holding `backup/` and `archive/` (defaults to
    /// `$HOME/.palm`).
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Force slow-sync for every database regardless of last-sync-PC.
    #[arg(long)]
    force_slow: bool,

    /// Force fast-sync for every database regardless of last-sync-PC.
    #[arg(long)]
    force_fast: bool,

    /// Highest bit rate to propose during wakeup negotiation.
    #[arg(long, default_value_t = DEFAULT_NEGOTIATED_RATE)]
    rate: u32,

    /// This workstation's 32-bit host id, as a hex string. Defaults to a
    /// value derived from the machine's primary IPv4 address.
    #[arg(long)]
    host_id: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let host = match &cli.host_id {
        Some(hex) => match u32::from_str_radix(hex.trim_start_matches("0x"), 16) {
            Ok(id) => HostIdentity::with_id(id),
            Err(e) => {
                eprintln!("invalid --host-id {hex:?}: {e}");
                std::process::exit(2);
            }
        },
        None => guess_host_identity(),
    };

    let base_dir = cli.base_dir.unwrap_or_else(default_base_dir);
    let mut config = SyncConfig::new(host, base_dir.join("backup"), base_dir.join("archive"));
    config.force_slow = cli.force_slow;
    config.force_fast = cli.force_fast;
    config.preferred_rate = cli.rate;

    if let Err(e) = std::fs::create_dir_all(&config.backup_dir) {
        eprintln!("cannot create backup directory {:?}: {e}", config.backup_dir);
        std::process::exit(3);
    }
    if let Err(e) = std::fs::create_dir_all(&config.archive_dir) {
        eprintln!("cannot create archive directory {:?}: {e}", config.archive_dir);
        std::process::exit(3);
    }

    let engine = SyncEngine::new(config);
    cancel_signal::install(engine.config().cancel.clone());
    let outcome = match cli.link {
        Link::Serial => run_serial(&engine, cli.device.as_deref()),
        Link::Usb => run_usb(&engine, cli.device.as_deref()),
        Link::Tcp => run_tcp(&engine, cli.device.as_deref(), host),
    };

    match outcome {
        Ok(Outcome::Complete) => std::process::exit(0),
        Ok(Outcome::Partial) => std::process::exit(1),
        Ok(Outcome::Fatal) | Err(_) => std::process::exit(2),
    }
}

#[cfg(unix)]
fn run_serial(engine: &SyncEngine, device: Option<&str>) -> Result<Outcome, cs_core::CoreError> {
    let path = device.unwrap_or("/dev/pilot");
    let transport = SerialTransport::open(path).map_err(|e| cs_core::CoreError::Link(e.to_string()))?;
    drive(engine, transport)
}

#[cfg(not(unix))]
fn run_serial(_engine: &SyncEngine, _device: Option<&str>) -> Result<Outcome, cs_core::CoreError> {
    Err(cs_core::CoreError::Local("serial transport is unix-only".into()))
}

#[cfg(unix)]
fn run_usb(engine: &SyncEngine, device: Option<&str>) -> Result<Outcome, cs_core::CoreError> {
    let path = device.unwrap_or("/dev/usb/hiddev0");
    let transport = UsbTransport::open(path).map_err(|e| cs_core::CoreError::Link(e.to_string()))?;
    drive(engine, transport)
}

#[cfg(not(unix))]
fn run_usb(_engine: &SyncEngine, _device: Option<&str>) -> Result<Outcome, cs_core::CoreError> {
    Err(cs_core::CoreError::Local("usb transport is unix-only".into()))
}

fn run_tcp(engine: &SyncEngine, device: Option<&str>, host: HostIdentity) -> Result<Outcome, cs_core::CoreError> {
    let peer: std::net::Ipv4Addr = device
        .unwrap_or("0.0.0.0")
        .parse()
        .map_err(|_| cs_core::CoreError::Local("invalid --device IPv4 address".into()))?;
    let hostname = hostname_guess();
    let transport = TcpTransport::wakeup(peer, host.id(), std::net::Ipv4Addr::new(255, 255, 255, 0), &hostname)
        .map_err(|e| cs_core::CoreError::Link(e.to_string()))?;
    drive(engine, transport)
}

fn drive<T: Transport>(engine: &SyncEngine, transport: T) -> Result<Outcome, cs_core::CoreError> {
    let report = BackupMode::new(engine).run(transport)?;
    for db in &report.databases {
        tracing::info!("{}", db.log_line);
    }
    Ok(report.outcome())
}

/// Best-effort derivation of this workstation's primary IPv4 address by
/// connecting a UDP socket to a well-known address and reading back the
/// address the kernel picked (no packets are actually sent). Falls back to
/// loopback, which still yields a deterministic, if not globally unique,
/// host id -- any globally-unique 32-bit value is acceptable, but this
/// fallback only satisfies that on a single-host setup.
fn guess_host_identity() -> HostIdentity {
    let addr = UdpSocket::bind("0.0.0.0:0")
        .and_then(|sock| {
            sock.connect("8.8.8.8:80")?;
            sock.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    match addr {
        IpAddr::V4(v4) => HostIdentity::from_ipv4(v4),
        IpAddr::V6(_) => HostIdentity::from_ipv4(std::net::Ipv4Addr::LOCALHOST),
    }
}

fn hostname_guess() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "coldsync-host".to_string())
}

fn default_base_dir() -> PathBuf {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".palm")).unwrap_or_else(|| PathBuf::from(".palm"))
}
