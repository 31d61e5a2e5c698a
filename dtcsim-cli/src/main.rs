//! Thin binary: parses a config file, opens a platform tun device, and
//! wires it into `dtcsim_core::router`. Logging uses `fern` + `chrono`
//! with colored terminal output and `-v`-counted verbosity.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dtcsim_core::config::RouterConfig;
use dtcsim_core::context::{NoopProtector, RouterEvent};
use dtcsim_core::router;
use dtcsim_core::tun::Tun;

#[derive(Parser, Debug)]
#[command(author, version, about = "Userspace satellite/DTC link emulator")]
struct Cli {
    /// Path to a JSON or YAML router config file.
    #[arg(short, long)]
    config: PathBuf,

    /// Tun device name to create (Linux only).
    #[arg(long, default_value = "dtc0")]
    tun_name: String,

    /// How often to log a statistics snapshot, in seconds. 0 disables it.
    #[arg(long, default_value_t = 10)]
    stats_interval_secs: u64,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_log(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{:<5}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Warn)
                .chain(std::io::stderr()),
        )
        .chain(
            fern::Dispatch::new()
                .filter(|m| m.level() > log::LevelFilter::Warn)
                .chain(std::io::stdout()),
        )
        .apply()
        .context("failed to install logger")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_log(cli.verbose)?;

    let config = RouterConfig::load_from_path(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let tun_addr = config.tun_addr;

    let tun = open_platform_tun(&cli.tun_name, tun_addr)
        .context("opening tun device (are you running as root?)")?;

    log::info!("dtcsim starting on {} (tun address {})", cli.tun_name, tun_addr);
    let (handle, mut events) = router::spawn(tun, Arc::new(NoopProtector), config);

    let stats_interval = cli.stats_interval_secs;
    let stats_handle = handle.clone();
    tokio::spawn(async move {
        if stats_interval == 0 {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval));
        loop {
            ticker.tick().await;
            let snap = stats_handle.stats();
            log::info!(
                "stats: sent {}B/{}pk received {}B/{}pk outbound_q={} inbound_q={} dropped={}",
                snap.sent_bytes,
                snap.sent_packets,
                snap.received_bytes,
                snap.received_packets,
                snap.outbound_queue_size,
                snap.inbound_queue_size,
                snap.total_dropped
            );
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                handle.stop();
                return Ok(());
            }
            event = events.recv() => match event {
                Some(RouterEvent::Fatal(reason)) => {
                    log::error!("fatal router event: {reason}");
                    handle.stop();
                    anyhow::bail!("router stopped: {reason}");
                }
                Some(RouterEvent::SessionEstablished(key)) => {
                    log::debug!("session established: {key:?}");
                }
                Some(RouterEvent::SessionClosed(key)) => {
                    log::debug!("session closed: {key:?}");
                }
                None => return Ok(()),
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn open_platform_tun(name: &str, _addr: Ipv4Addr) -> Result<Arc<dyn Tun>> {
    linux_tun::LinuxTun::open(name).map(|t| Arc::new(t) as Arc<dyn Tun>)
}

#[cfg(not(target_os = "linux"))]
fn open_platform_tun(_name: &str, _addr: Ipv4Addr) -> Result<Arc<dyn Tun>> {
    anyhow::bail!("no tun backend is implemented for this platform")
}

#[cfg(target_os = "linux")]
mod linux_tun {
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::sync::Mutex;

    use anyhow::{Context, Result};
    use dtcsim_core::tun::Tun;

    const IFF_TUN: libc::c_short = 0x0001;
    const IFF_NO_PI: libc::c_short = 0x1000;
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

    #[repr(C)]
    struct IfReq {
        name: [libc::c_char; 16],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    /// A `/dev/net/tun` handle in TUN (no Ethernet framing) mode. `recv`
    /// and `send` are blocking reads/writes on the raw fd, run by the
    /// router on dedicated blocking tasks.
    pub struct LinuxTun {
        read_half: Mutex<File>,
        write_half: Mutex<File>,
    }

    impl LinuxTun {
        pub fn open(name: &str) -> Result<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/net/tun")
                .context("opening /dev/net/tun")?;

            let mut req: IfReq = unsafe { std::mem::zeroed() };
            for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
                *dst = src as libc::c_char;
            }
            req.flags = IFF_TUN | IFF_NO_PI;

            let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &req) };
            if ret < 0 {
                anyhow::bail!("TUNSETIFF ioctl failed: {}", std::io::Error::last_os_error());
            }

            let write_half = file.try_clone().context("cloning tun fd")?;
            Ok(Self {
                read_half: Mutex::new(file),
                write_half: Mutex::new(write_half),
            })
        }
    }

    impl Tun for LinuxTun {
        fn recv(&self) -> Option<Vec<u8>> {
            let mut buf = vec![0u8; 65536];
            let mut file = self.read_half.lock().unwrap();
            match file.read(&mut buf) {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some(buf)
                }
                Err(_) => None,
            }
        }

        fn send(&self, frame: &[u8]) -> std::io::Result<()> {
            self.write_half.lock().unwrap().write_all(frame)
        }
    }
}
