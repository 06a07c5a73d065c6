//! Logging infrastructure for CrabOTG
//!
//! This module provides logging via the `log` crate. The crate has no
//! console of its own: the embedding kernel registers a [`LogSink`] and every
//! record is formatted as a `[LEVEL] message` line and handed to it.

use atomic_refcell::AtomicRefCell;
use core::fmt::{self, Write};
use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};

/// Destination for formatted log lines
pub trait LogSink: Sync {
    /// Write part of a line. A line ends with `'\n'`.
    fn write_str(&self, text: &str);
}

/// Adapts a sink to `fmt::Write` for one record.
struct SinkWriter<'a>(&'a dyn LogSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        self.0.write_str(text);
        Ok(())
    }
}

/// Forwards records to the registered sink
struct SinkLogger {
    sink: AtomicRefCell<Option<&'static dyn LogSink>>,
}

impl SinkLogger {
    const fn new() -> Self {
        Self {
            sink: AtomicRefCell::new(None),
        }
    }

    /// Point the logger at `sink`, waiting out any record in flight.
    fn install(&self, sink: &'static dyn LogSink) {
        loop {
            if let Ok(mut current) = self.sink.try_borrow_mut() {
                *current = Some(sink);
                return;
            }
            core::hint::spin_loop();
        }
    }
}

impl log::Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Registration in progress; drop the record rather than spin.
        let Ok(sink) = self.sink.try_borrow() else {
            return;
        };
        let Some(sink) = *sink else {
            return;
        };

        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let _ = writeln!(SinkWriter(sink), "[{}] {}", level, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: SinkLogger = SinkLogger::new();

/// Initialize the logging subsystem
///
/// Fails if a logger was already installed; the existing one keeps its sink.
pub fn init(sink: &'static dyn LogSink, level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    LOGGER.install(sink);
    log::set_max_level(level);
    Ok(())
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;
    use std::string::String;
    use std::sync::Mutex;

    struct Recorder(Mutex<String>);

    impl LogSink for Recorder {
        fn write_str(&self, text: &str) {
            self.0.lock().unwrap().push_str(text);
        }
    }

    static RECORDER: Recorder = Recorder(Mutex::new(String::new()));

    #[test]
    fn records_are_formatted_with_their_level() {
        let logger = SinkLogger::new();
        *logger.sink.borrow_mut() = Some(&RECORDER);

        logger.log(
            &Record::builder()
                .level(Level::Error)
                .args(format_args!("DWHCI: channel {} stuck", 3))
                .build(),
        );

        let output = RECORDER.0.lock().unwrap();
        assert!(output.contains("[ERROR] DWHCI: channel 3 stuck\n"));
    }

    static FIRST: Recorder = Recorder(Mutex::new(String::new()));
    static SECOND: Recorder = Recorder(Mutex::new(String::new()));

    #[test]
    fn second_init_keeps_the_installed_sink() {
        init(&FIRST, LevelFilter::Trace).unwrap();
        assert!(init(&SECOND, LevelFilter::Trace).is_err());

        log::error!("SPB: bus wedged");

        assert!(FIRST.0.lock().unwrap().contains("[ERROR] SPB: bus wedged\n"));
        assert!(SECOND.0.lock().unwrap().is_empty());
    }

    #[test]
    fn install_replaces_the_sink() {
        let logger = SinkLogger::new();
        logger.install(&RECORDER);
        assert!(logger.sink.borrow().is_some());
    }

    #[test]
    fn records_without_a_sink_are_dropped() {
        let logger = SinkLogger::new();
        logger.log(&Record::builder().level(Level::Error).args(format_args!("lost")).build());
        assert!(logger.sink.borrow().is_none());
    }
}
