//! # Logger
//!
//! Stderr logger used by all the components. Stdout carries the control
//! protocol consumed by the capture frontend and must never be written to from
//! here.

use std::io::Write;

use anyhow::Result;
use log::{Level, LevelFilter, Log, Metadata, Record};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use time::{macros::format_description, OffsetDateTime};

pub(crate) struct Logger {
    color: ColorChoice,
}

impl Logger {
    /// Install the logger as the global one. Records at `Info` and above are
    /// shown until debug is enabled.
    pub(crate) fn init() -> Result<()> {
        let color = match atty_stderr() {
            true => ColorChoice::Auto,
            false => ColorChoice::Never,
        };
        log::set_boxed_logger(Box::new(Logger { color }))?;
        log::set_max_level(LevelFilter::Info);
        Ok(())
    }

    /// Enable debug traces for the rest of the process lifetime.
    pub(crate) fn set_debug(debug: bool) {
        log::set_max_level(match debug {
            true => LevelFilter::Debug,
            false => LevelFilter::Info,
        });
    }
}

fn atty_stderr() -> bool {
    // SAFETY: isatty only inspects the descriptor.
    unsafe { libc::isatty(libc::STDERR_FILENO) == 1 }
}

fn level_color(level: Level) -> Color {
    match level {
        Level::Error => Color::Red,
        Level::Warn => Color::Yellow,
        Level::Info => Color::Green,
        Level::Debug | Level::Trace => Color::Blue,
    }
}

pub(crate) fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    ))
    .unwrap_or_default()
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut stderr = StandardStream::stderr(self.color);
        let _ = write!(stderr, "{} ", timestamp());
        let _ = stderr.set_color(ColorSpec::new().set_fg(Some(level_color(record.level()))));
        let _ = write!(stderr, "{:5}", record.level());
        let _ = stderr.reset();

        // Debug traces point back to where they come from.
        let _ = match record.level() {
            Level::Debug | Level::Trace => writeln!(
                stderr,
                " [{}:{}] {}",
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            ),
            _ => writeln!(stderr, " {}", record.args()),
        };
    }

    fn flush(&self) {
        let _ = StandardStream::stderr(self.color).flush();
    }
}
