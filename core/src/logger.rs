//! Logging setup for binaries built on the rig core.
//!
//! The library itself only talks to the `log` facade. A binary calls `init`
//! once, with the level and optional log file it resolved from its own
//! configuration, to get coloured console output plus an optional plain file.

use std::path::Path;

use chrono::Local;
use fern::colors::{Color, ColoredLevelConfig};
use fern::Dispatch;
use log::LevelFilter;

/// Parse a level name (`"warn"`, `"debug"`, ...) falling back to `Info`.
pub fn level_from_str(level: &str) -> LevelFilter {
    level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)
}

/// Install the global logger. Errors from a second installation are reported
/// on stderr and otherwise ignored.
pub fn init(level: LevelFilter, log_file: Option<&Path>) {
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::BrightBlack);

    let console = Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .chain(std::io::stderr());

    let mut root = Dispatch::new()
        .level(level)
        .level_for("serde", LevelFilter::Warn)
        .chain(console);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                eprintln!("rig: cannot create log directory '{}': {}", parent.display(), e);
            }
        }
        match fern::log_file(path) {
            Ok(file) => {
                let file_config = Dispatch::new()
                    .format(|out, message, record| {
                        out.finish(format_args!(
                            "[{} {} {}] {}",
                            Local::now().format("%Y-%m-%d %H:%M:%S"),
                            record.level(),
                            record.target(),
                            message
                        ))
                    })
                    .chain(file);
                root = root.chain(file_config);
            }
            Err(e) => eprintln!("rig: cannot open log file '{}': {}", path.display(), e),
        }
    }

    if let Err(e) = root.apply() {
        eprintln!("rig: failed to install logger: {}", e);
    }
}
