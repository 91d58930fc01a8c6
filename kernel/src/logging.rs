//! Kernel logging facility
//!
//! Routes the `log` facade to the serial port. Log levels are configured
//! based on build configuration (debug/release).
//!
//! The logger holds no lock of its own: each line is written in one call
//! to the serial port, which serialises writers with interrupts masked.
//! Interrupt handlers may therefore log at any time.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger;

/// Serial logger.
#[derive(Debug, Default, Clone, Copy)]
pub struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] target: message"
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::serial_println!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// The level `init` installs: Debug in debug builds, Info in release.
pub const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Installs [`LOGGER`]. Fails if another logger was set first.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(default_level()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt;
    use log::Level;

    #[test]
    fn test_logger_respects_max_level() {
        log::set_max_level(LevelFilter::Info);
        let info = Metadata::builder().level(Level::Info).build();
        let trace = Metadata::builder().level(Level::Trace).build();
        assert!(LOGGER.enabled(&info));
        assert!(!LOGGER.enabled(&trace));
    }

    #[test]
    fn test_default_level_follows_build() {
        #[cfg(debug_assertions)]
        assert_eq!(default_level(), LevelFilter::Debug);
        #[cfg(not(debug_assertions))]
        assert_eq!(default_level(), LevelFilter::Info);
    }

    /// Logs another line while being formatted, the way a handler that
    /// fires in the middle of a log call would.
    struct Interrupting;

    impl fmt::Display for Interrupting {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            LOGGER.log(
                &Record::builder()
                    .level(Level::Error)
                    .target("timer")
                    .args(format_args!("tick"))
                    .build(),
            );
            write!(f, "outer line")
        }
    }

    #[test]
    fn test_logging_while_a_line_is_in_flight() {
        log::set_max_level(LevelFilter::Info);
        LOGGER.log(
            &Record::builder()
                .level(Level::Error)
                .target("scheduler")
                .args(format_args!("{}", Interrupting))
                .build(),
        );
    }
}
