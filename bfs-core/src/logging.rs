//! A thin `log::Log` front end honoring the `*.log_enabled` /
//! `*.log_verbose` / `*.log_to_file` / `*.logfile` toggles from
//! `spec.md` §6. One logger per process, shared by every per-client
//! thread, so each line carries the thread's name/id to keep interleaved
//! client output distinguishable.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

enum Sink {
    Stderr,
    File(Mutex<std::fs::File>),
}

/// The logger this crate registers with [`log::set_boxed_logger`].
pub struct BfsLogger {
    enabled: bool,
    verbose: bool,
    sink: Sink,
}

impl BfsLogger {
    pub fn new(enabled: bool, verbose: bool, to_file: bool, logfile: Option<&str>) -> Self {
        let sink = if to_file {
            match logfile.and_then(|path| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .ok()
            }) {
                Some(f) => Sink::File(Mutex::new(f)),
                None => Sink::Stderr,
            }
        } else {
            Sink::Stderr
        };
        Self {
            enabled,
            verbose,
            sink,
        }
    }

    /// Installs this logger as the global `log` facade sink.
    pub fn install(self) {
        let max_level = if self.verbose {
            LevelFilter::Trace
        } else {
            LevelFilter::Debug
        };
        log::set_max_level(max_level);
        let _ = log::set_boxed_logger(Box::new(self));
    }

    fn write_line(&self, line: &str) {
        match &self.sink {
            Sink::Stderr => eprintln!("{line}"),
            Sink::File(f) => {
                if let Ok(mut file) = f.lock() {
                    let _ = writeln!(file, "{line}");
                }
            }
        }
    }
}

impl Log for BfsLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.verbose && metadata.level() > Level::Debug {
            return false;
        }
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        self.write_line(&format!(
            "[{level}][{thread}] {target}: {args}",
            level = record.level(),
            thread = thread_name,
            target = record.target(),
            args = record.args(),
        ));
    }

    fn flush(&self) {
        if let Sink::File(f) = &self.sink {
            if let Ok(mut file) = f.lock() {
                let _ = file.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_logger_filters_everything() {
        let logger = BfsLogger::new(false, true, false, None);
        let record = Record::builder()
            .args(format_args!("hi"))
            .level(Level::Error)
            .target("t")
            .build();
        assert!(!logger.enabled(record.metadata()));
    }

    #[test]
    fn non_verbose_logger_filters_debug_and_trace() {
        let logger = BfsLogger::new(true, false, false, None);
        let debug = Record::builder()
            .args(format_args!("hi"))
            .level(Level::Debug)
            .target("t")
            .build();
        let info = Record::builder()
            .args(format_args!("hi"))
            .level(Level::Info)
            .target("t")
            .build();
        assert!(!logger.enabled(debug.metadata()));
        assert!(logger.enabled(info.metadata()));
    }
}
