//! Diagnostic logging
//! Installs `env_logger` with a local timestamp on every line. `RUST_LOG`
//! takes precedence over the level given on the command line.

use std::io::Write;

use chrono::Local;
use env_logger::{Builder, Env};
use log::{LevelFilter, SetLoggerError};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    let mut builder = Builder::new();
    builder
        .filter_level(level)
        .parse_env(Env::default())
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format(TIMESTAMP_FORMAT),
                record.level(),
                record.target(),
                record.args()
            )
        });
    builder.try_init()?;
    log::info!("Logging initialized");
    Ok(())
}
