//! Coloured stderr logger for the `log` facade.

use std::fmt;

/// Dummy type to help us implement a logger using the `log` crate.
struct Logger;

static LOGGER: Logger = Logger;

#[derive(Debug, Clone, Copy)]
enum Color {
    Red,
    Green,
    Yellow,
    White,
}

/// SGR foreground colour sequence, e.g. `\x1B[31m`.
struct Foreground(Color);

impl fmt::Display for Foreground {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self.0 {
            Color::Red => 31,
            Color::Green => 32,
            Color::Yellow => 33,
            Color::White => 37,
        };
        write!(f, "\x1B[{code}m")
    }
}

const CLEAR_FORMAT: &str = "\x1B[0m";

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let color = match record.level() {
                log::Level::Error => Color::Red,
                log::Level::Warn => Color::Yellow,
                log::Level::Info => Color::Green,
                // White is actually kinda grey. Bright white is white.
                log::Level::Debug | log::Level::Trace => Color::White,
            };
            eprintln!(
                "{}[{}]{CLEAR_FORMAT} {}: {}",
                Foreground(color),
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

pub(crate) fn init(verbose: bool) {
    log::set_logger(&LOGGER).expect("logger already set");
    log::set_max_level(if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    log::debug!("Logging initialized");
}
