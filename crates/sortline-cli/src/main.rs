//! `sortline-cli` – the `sortline` binary.
//!
//! 1. Loads `~/.sortline/config.toml` (or the path given as the first
//!    argument), writing the prototype-line default when it is absent.
//!    An invalid configuration is fatal.
//! 2. Starts the sorting engine against simulated output channels.
//! 3. Drops the operator into the console (see [`repl`]).
//! 4. Intercepts **Ctrl-C** to latch the emergency stop, return every
//!    actuator to rest and exit.

mod config;
mod repl;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use sortline_hal::HardwareRegistry;
use sortline_middleware::{BusSink, EventBus, LogSink, TelemetrySink};
use sortline_runtime::{SortingEngine, init_tracing};
use tracing::{error, warn};

use crate::config::SinkKind;

fn main() -> ExitCode {
    let _guard = init_tracing("sortline");

    print_banner();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::config_path);

    let cfg = match config::load_or_create(&path) {
        Ok((cfg, created)) => {
            let verb = if created { "Default config written to" } else { "Config loaded from" };
            println!("  {} {}", verb, path.display().to_string().bold());
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let (engine_config, table) = match cfg.to_engine() {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %e, "invalid line configuration");
            println!("{}: {}", "Invalid configuration".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    let sensors = engine_config.sensors.clone();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let bus = EventBus::default();
    let (registry, probes) = HardwareRegistry::simulated(&table);
    let sink: Arc<dyn TelemetrySink> = match cfg.telemetry.sink {
        SinkKind::Log => Arc::new(LogSink),
        SinkKind::Bus => Arc::new(BusSink::new(bus.clone())),
    };
    let started = {
        let _entered = runtime.enter();
        SortingEngine::start(engine_config, table, registry, sink, bus)
    };
    let engine = match started {
        Ok(engine) => engine,
        Err(e) => {
            println!("{}: {}", "Engine failed to start".red(), e);
            return ExitCode::FAILURE;
        }
    };

    println!(
        "  {} actuator(s) on simulated channels, telemetry → {}",
        probes.len(),
        cfg.telemetry.sink.to_string().bold()
    );

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let ctrlc_engine = engine.clone();
    let ctrlc_runtime = runtime.handle().clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – emergency stop …".yellow().bold());
        ctrlc_runtime.block_on(async {
            ctrlc_engine.emergency_stop("operator Ctrl-C").await;
            ctrlc_engine.shutdown().await;
        });
        println!("{}", "  ✓ All actuators at rest. Exiting.".green());
        std::process::exit(130);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; Ctrl-C will not stop the line safely");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::Console {
        runtime: &runtime,
        engine: &engine,
        probes: &probes,
        sensors: &sensors,
    }
    .run();

    runtime.block_on(engine.shutdown());
    ExitCode::SUCCESS
}

fn print_banner() {
    println!();
    println!("{}", r#"   ___           __  __   _         "#.bold().cyan());
    println!("{}", r#"  / __| ___ _ _ | |_| | (_)_ _  ___ "#.bold().cyan());
    println!("{}", r#"  \__ \/ _ \ '_||  _| |_| | ' \/ -_)"#.bold().cyan());
    println!("{}", r#"  |___/\___/_|   \__|___|_|_||_\___|"#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Sortline".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Fruit-sorting actuation and safety core");
    println!();
}
