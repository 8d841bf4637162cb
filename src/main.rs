//! Kaffi daemon entry point.
//!
//! `kaffi start` runs the controller with a small operator REPL on stdin;
//! `--headless` runs it as a plain daemon driven only by signals.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kaffi::{Config, System};

/// Global flag for signal-triggered shutdown (as Arc for signal-hook
/// compatibility).
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller.
    Start {
        /// No REPL; run until signalled.
        #[arg(long)]
        headless: bool,
    },
    /// Print the effective configuration.
    Config,
}

fn main() -> Result<()> {
    // Log to a file so the REPL does not interleave with log output.
    let log_path = kaffi::config::log_file_path();
    let log_file = std::fs::File::create(&log_path)
        .unwrap_or_else(|_| panic!("failed to create log file at {log_path:?}"));
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .init();

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {panic_info:?}");
        default_hook(panic_info);
    }));

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { headless } => run(headless),
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn run(headless: bool) -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let config = Config::load()?;
    let mut system = System::new(config)?;
    system.start()?;
    log::info!("kaffi v{} started", env!("CARGO_PKG_VERSION"));

    if headless {
        while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    } else {
        run_repl(&mut system)?;
    }

    system.stop();
    Ok(())
}

fn run_repl(system: &mut System) -> Result<()> {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        if SHUTDOWN_FLAG.load(Ordering::Relaxed) {
            break;
        }
        print!(">> ");
        io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF
            println!();
            break;
        }
        match line.trim() {
            "" => {}
            "help" => println!("commands: help status start stop quit"),
            "status" => println!("{}", system.status()),
            "start" => {
                if let Err(e) = system.start() {
                    eprintln!("start failed: {e:#}");
                }
            }
            "stop" => system.stop(),
            "quit" | "exit" => break,
            other => println!("unknown command: {other}"),
        }
    }
    Ok(())
}
