//! Root Chooser - secondary boot menu for Android devices
//!
//! Runs as the first process of a small initramfs:
//! - Waits for the console and paints the background image
//! - Reads boot descriptors from the data partition
//! - Counts down, then boots the default entry or shows a menu
//! - Hands the chosen kernel to kexec, or starts the stock `/init`

use std::io::Write;

mod chooser;
mod cmdline;
mod config;
mod console;
mod entry;
mod fb;
mod system;

use chooser::Chooser;
use config::ChooserConfig;
use console::Console;
use system::LinuxSystem;

fn main() {
    let pid = std::process::id();
    if pid != 1 {
        eprintln!("root-chooser: Warning: Not running as PID 1 (pid={})", pid);
    }

    let env_level = init_logging();

    log::info!("Root chooser v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = ChooserConfig::load();
    if !env_level {
        log::set_max_level(config.log_level());
    }

    let system = LinuxSystem::new(&config);
    let console = Console::new(&config.paths);
    let mut chooser = Chooser::new(config, system, console);

    match chooser.run() {
        Ok(never) => match never {},
        Err(e) => {
            log::error!("Cannot start the primary OS: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether `RUST_LOG` picked the level
fn init_logging() -> bool {
    let from_env = std::env::var_os("RUST_LOG").is_some();

    // let everything through the logger, the max level does the filtering
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format(|buf, record| writeln!(buf, "[root-chooser] {}: {}", record.level(), record.args()))
        .init();

    if !from_env {
        log::set_max_level(log::LevelFilter::Info);
    }
    from_env
}
