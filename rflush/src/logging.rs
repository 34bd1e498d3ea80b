//! Process-wide logging setup.
//!
//! The library only emits through the `log` facade. Front ends call [`init`]
//! once; `RUST_LOG` still overrides the level given here.

use std::sync::Once;

use log::LevelFilter;

static INIT: Once = Once::new();

/// Install an `env_logger` backend at `level`. Later calls only adjust the
/// threshold.
pub fn init(level: LevelFilter) {
    INIT.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .format_timestamp_micros()
            .try_init();
    });
    set_threshold(level);
}

/// Change the maximum level emitted at run time.
pub fn set_threshold(level: LevelFilter) {
    log::set_max_level(level);
}

/// The current maximum level.
pub fn threshold() -> LevelFilter {
    log::max_level()
}
