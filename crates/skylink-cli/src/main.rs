//! `skylink` – SkyLink operator shell
//!
//! This binary is the ground-station entry point for the message bridge.  It:
//!
//! 1. Checks for `~/.skylink/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 2. Builds one [`Bridge`] and connects it to the configured MQTT broker.
//! 3. Drops the operator into an **interactive REPL** with slash-commands
//!    (`/land`, `/brake`, `/send`, `/reconnect`, `/status`, `/logs`, `/help`).
//! 4. Intercepts **Ctrl-C** and shuts the bridge down cleanly before exiting.

mod config;
mod repl;
mod telemetry;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use skylink_middleware::Bridge;

fn main() {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG (default "warn"), SKYLINK_LOG_FORMAT=json, and OTLP export when
    // OTEL_EXPORTER_OTLP_ENDPOINT is set.  Operator output stays on println!.
    let _otel_guard = telemetry::init_tracing("skylink-cli");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    // Fires outside the line editor (e.g. during a slow connect); at the
    // prompt the editor reports Ctrl-C itself.
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    // ── Runtime + bridge ──────────────────────────────────────────────────
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    let bridge = Bridge::mqtt(cfg.bridge_config());

    print!(
        "\n  Connecting to {} … ",
        bridge.config().target.addr().dimmed()
    );
    flush_stdout();
    match rt.block_on(bridge.connect()) {
        Ok(()) => println!("{}", "online".green()),
        Err(e) => {
            println!("{}", "offline".yellow());
            println!("  {}", e.to_string().dimmed());
            println!("  Use {} to try again.", "/reconnect".bold());
        }
    }

    println!();
    println!(
        "  Type {} for a list of commands.\n",
        "/help".bold().cyan()
    );

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&rt, &bridge, cfg.log_lines, shutdown);

    rt.block_on(bridge.shutdown());
    println!("{}", "  ✓ Bridge disconnected. Exiting SkyLink.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       SkyLink First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up SkyLink.\n");

    let mut cfg = config::Config::default();

    cfg.broker_host = prompt_line(
        &format!("  MQTT broker host [{}]: ", cfg.broker_host),
        &cfg.broker_host,
    );

    let port_str = prompt_line(
        &format!("  MQTT broker port [{}]: ", cfg.broker_port),
        &cfg.broker_port.to_string(),
    );
    match port_str.trim().parse::<u16>() {
        Ok(p) => cfg.broker_port = p,
        Err(_) => println!(
            "  {} '{}' is not a valid port number, keeping {}",
            "Warning:".yellow(),
            port_str,
            cfg.broker_port
        ),
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }

    // Env overrides apply to the session even on first run.
    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   _____ __         __    _       __  "#.bold().cyan());
    println!("{}", r#"  / ___// /____  __/ /   (_)___  / /__"#.bold().cyan());
    println!("{}", r#"  \__ \/ //_/ / / / /   / / __ \/ //_/"#.bold().cyan());
    println!("{}", r#" ___/ / ,< / /_/ / /___/ / / / / ,<   "#.bold().cyan());
    println!("{}", r#"/____/_/|_|\__, /_____/_/_/ /_/_/|_|  "#.bold().cyan());
    println!("{}", r#"          /____/                      "#.bold().cyan());
    println!();
    println!("  {} {}",
        "SkyLink".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Ground-to-vehicle command bridge");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn flush_stdout() {
    use std::io::Write;
    std::io::stdout().flush().ok();
}

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::BufRead;
    print!("{}", msg);
    flush_stdout();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
