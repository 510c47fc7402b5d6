// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod config;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use config::Config;
use cpuhp::fake::FakeHotplug;
use cpuhp::AdminServer;
use cpuhp::ClientId;
use cpuhp::ClientKind;
use cpuhp::Cpumask;
use cpuhp::Engine;
use cpuhp::HotplugOps;
use cpuhp::SysfsHotplug;
use log::error;
use log::info;
use log::warn;

/// cpuhpd: CPU hotplug arbitration daemon
///
/// Clients state which CPUs they want online; cpuhpd keeps online exactly
/// the CPUs that every client agrees on. A CPU taken away by any client goes
/// offline. CPU 0 always stays online.
///
/// The SYSTEM and SYSFS clients exist from the start and request every
/// possible CPU. Further clients come from the config file or are
/// registered over the administrative socket, see cpuhpctl.
///
/// On exit every CPU is brought back online.
#[derive(Debug, Parser)]
struct Opts {
    /// Config file. Defaults to /etc/cpuhp/config.toml when present.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Administrative socket path, overrides the config file.
    #[clap(short = 's', long)]
    socket: Option<PathBuf>,

    /// Do not touch the host. Simulate this many CPUs, all initially
    /// online, and only log the transitions.
    #[clap(long)]
    fake_cpus: Option<usize>,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) -> Result<()> {
    let llv = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn setup<O: HotplugOps>(engine: &Engine<O>, config: &Config) -> Result<()> {
    for client in config.clients.iter() {
        let id = ClientId::parse(&client.name)?;
        let mask = engine
            .parse_mask(&client.mask)
            .with_context(|| format!("Invalid mask for client {}", client.name))?;
        engine.check_mask(&id, &mask)?;
        engine.register_client(id, mask, ClientKind::Registered)?;
    }

    if config.qos_client {
        engine.register_client(
            ClientId::Qos,
            engine.possible().clone(),
            ClientKind::Internal,
        )?;
    }

    if config.enable_on_start {
        engine.set_enabled(true)?;
    }
    Ok(())
}

fn run<O: HotplugOps + 'static>(opts: &Opts, config: &Config, ops: O) -> Result<()> {
    let engine = Arc::new(Engine::new(ops)?);
    setup(&engine, config)?;

    let socket = opts.socket.as_ref().unwrap_or(&config.socket_path);
    let server = AdminServer::new(engine.clone()).set_path(socket).launch()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let status = engine.status();
    info!(
        "cpuhpd running: enabled={} clients={} online={}",
        status.enabled,
        status.nr_clients,
        status
            .online
            .map(|m| m.to_cpulist())
            .unwrap_or_else(|| "?".into())
    );

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    drop(server);
    if let Err(e) = engine.set_enabled(false) {
        error!("failed to restore all cpus online ({:#})", e);
        return Err(e);
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(opts.verbose)?;

    // A broken cpumask resolution must not leave the daemon limping along
    // with a poisoned engine.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::abort();
    }));

    let config = config::init_config(opts.config.as_deref())?;

    match opts.fake_cpus {
        Some(nr_cpus) => {
            warn!("dry run, simulating {} cpus", nr_cpus);
            let ops = FakeHotplug::new(nr_cpus, &Cpumask::full(nr_cpus));
            run(&opts, &config, ops)
        }
        None => {
            let ops = SysfsHotplug::with_root(&config.sysfs_root)?;
            run(&opts, &config, ops)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticClient;
    use cpuhp::fake::HotplugCall::Up;

    fn engine() -> Engine<FakeHotplug> {
        Engine::new(FakeHotplug::new(8, &Cpumask::first(1, 8))).unwrap()
    }

    fn names(engine: &Engine<FakeHotplug>) -> Vec<String> {
        engine.clients().into_iter().map(|c| c.name).collect()
    }

    #[test]
    fn test_setup_defaults() {
        let engine = engine();
        let config = Config {
            clients: vec![StaticClient {
                name: "thermal".into(),
                mask: "0x0f".into(),
            }],
            ..Default::default()
        };
        setup(&engine, &config).unwrap();

        assert_eq!(names(&engine), vec!["SYSTEM", "SYSFS", "thermal", "HP_QOS"]);
        let status = engine.status();
        assert!(status.enabled);
        assert_eq!(status.last_applied, engine.parse_mask("0f").unwrap());
        assert_eq!(engine.ops().calls(), vec![Up(1), Up(2), Up(3)]);
    }

    #[test]
    fn test_setup_without_qos_or_enable() {
        let engine = engine();
        let config = Config {
            enable_on_start: false,
            qos_client: false,
            ..Default::default()
        };
        setup(&engine, &config).unwrap();

        assert_eq!(names(&engine), vec!["SYSTEM", "SYSFS"]);
        assert!(!engine.status().enabled);
        assert!(engine.ops().calls().is_empty());
    }

    #[test]
    fn test_setup_rejects_mask_without_boot_cpu() {
        let engine = engine();
        let config = Config {
            clients: vec![StaticClient {
                name: "thermal".into(),
                mask: "0xf0".into(),
            }],
            ..Default::default()
        };
        assert!(setup(&engine, &config).is_err());
        assert_eq!(engine.status().nr_clients, 2);
        assert!(!engine.status().enabled);
    }
}
