//! Process-wide Wasmtime engine.
//!
//! Every plugin and compiled plugin shares one engine so compiled modules can
//! be instantiated into any store. Fuel metering and epoch interruption are
//! always enabled; a background thread advances the epoch so stores can
//! observe cancellation and call deadlines while guest code is running.

use crate::error::Error;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};
use wasmtime::Engine;

/// Interval between epoch increments.
pub const EPOCH_TICK_INTERVAL: Duration = Duration::from_millis(10);

static ENGINE: OnceLock<Engine> = OnceLock::new();

fn create_shared_engine() -> Result<Engine, Error> {
    let mut config = wasmtime::Config::new();
    config.consume_fuel(true);
    config.epoch_interruption(true);
    Ok(Engine::new(&config)?)
}

fn start_epoch_ticker(engine: Engine) -> Result<(), Error> {
    std::thread::Builder::new()
        .name("plughost-epoch-ticker".to_string())
        .spawn(move || {
            loop {
                std::thread::sleep(EPOCH_TICK_INTERVAL);
                engine.increment_epoch();
            }
        })?;
    debug!(interval_ms = EPOCH_TICK_INTERVAL.as_millis() as u64, "Epoch ticker started");
    Ok(())
}

/// Returns the shared engine, creating it and its ticker on first access.
pub(crate) fn shared_engine() -> Result<&'static Engine, Error> {
    if let Some(engine) = ENGINE.get() {
        return Ok(engine);
    }
    let engine = create_shared_engine()?;
    if ENGINE.set(engine.clone()).is_ok() {
        info!("Created shared Wasmtime engine");
        start_epoch_ticker(engine)?;
    }
    ENGINE
        .get()
        .ok_or_else(|| Error::Config("shared engine unavailable".into()))
}
