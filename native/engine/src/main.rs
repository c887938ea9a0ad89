use std::{error::Error, path::PathBuf};

use anyhow::{Context, Result};
use engine::{Engine, EventBus, logging::setup_logging, settings::SettingsHandler};
use mimalloc::MiMalloc;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn app_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("HEADSET_ENGINE_HOME") {
        return Ok(PathBuf::from(dir));
    }
    let data_dir = dirs::data_dir().context("Failed to get data directory")?;
    Ok(data_dir.join("HeadsetEngine"))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!(message = %format!("{panic_info}\n{backtrace}"), "Rust panic");
        original_hook(panic_info);
    }));

    let app_dir = app_dir()?;
    fs_err::create_dir_all(&app_dir)?;

    let events = EventBus::new();
    let _guard = match setup_logging(&app_dir.join("logs"), events.clone()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to setup logging: {e:#}");
            None
        }
    };

    info!(app_dir = %app_dir.display(), "Starting headset engine");
    let settings = SettingsHandler::new(&app_dir);
    let engine = Engine::start(app_dir, settings, events).await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = &e as &dyn Error, "Failed to listen for shutdown signal");
    }
    engine.shutdown();
    info!("Headset engine stopped");
    Ok(())
}
