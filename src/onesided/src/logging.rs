use std::fmt;

use ansi_term::Colour;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{Directive, EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::Config;

pub const LOG_ENV: &str = "ONESIDED_LOG";

struct FmtLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

const TRACE_STR: &str = "TRACE";
const DEBUG_STR: &str = "DEBUG";
const INFO_STR: &str = " INFO";
const WARN_STR: &str = " WARN";
const ERROR_STR: &str = "ERROR";

impl<'a> fmt::Display for FmtLevel<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (text, colour) = match *self.level {
            Level::TRACE => (TRACE_STR, Colour::Purple),
            Level::DEBUG => (DEBUG_STR, Colour::Blue),
            Level::INFO => (INFO_STR, Colour::Green),
            Level::WARN => (WARN_STR, Colour::Yellow),
            Level::ERROR => (ERROR_STR, Colour::Red),
        };
        if self.ansi {
            write!(f, "{}", colour.paint(text))
        } else {
            f.pad(text)
        }
    }
}

/// Which end of the connection a process is. Shown on every line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Client => "client",
            Role::Server => "server",
        })
    }
}

/// `[timestamp LEVEL role file:line] message`
struct OnesidedFormatter {
    role: Role,
    ansi: bool,
}

/// Source files are shown by name only.
fn short_file(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn write_prefix<W: fmt::Write>(
    w: &mut W,
    timestamp: impl fmt::Display,
    level: FmtLevel<'_>,
    role: Role,
    file: Option<&str>,
    line: Option<u32>,
) -> fmt::Result {
    write!(
        w,
        "[{} {} {} {}:{}] ",
        timestamp,
        level,
        role,
        file.map_or("<unnamed>", short_file),
        line.unwrap_or(0),
    )
}

impl<S, N> FormatEvent<S, N> for OnesidedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        use chrono::Utc;
        let metadata = event.metadata();
        let fmt_level = FmtLevel {
            level: metadata.level(),
            ansi: self.ansi && writer.has_ansi_escapes(),
        };

        write_prefix(
            &mut writer,
            Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            fmt_level,
            self.role,
            metadata.file(),
            metadata.line(),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber. The filter comes from `ONESIDED_LOG`, falling back to the
/// configured `log_level`; an unparsable level falls back to `info`.
pub fn init_log(config: &Config, role: Role, ansi: bool) {
    use tracing_subscriber::prelude::*;

    let default_directive: Directive = config.log_level.parse().unwrap_or_else(|_| {
        eprintln!("invalid log level {:?}, using info", config.log_level);
        LevelFilter::INFO.into()
    });

    let log_env_filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let log_fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(ansi)
        .event_format(OnesidedFormatter { role, ansi })
        .with_filter(log_env_filter);

    tracing_subscriber::registry().with(log_fmt_layer).init();
    tracing::debug!("logging initialized");
}
