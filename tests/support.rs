#![allow(dead_code)]

use log::LevelFilter;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Install a `log` subscriber for the current test binary, once. Mirrors
/// `webern-midi_file`'s `tests/utils.rs::enable_logging` — a handful of
/// integration tests opt in rather than every test paying the init cost.
pub fn enable_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::Builder::new().filter(None, LevelFilter::Warn).is_test(true).try_init();
    });
}
