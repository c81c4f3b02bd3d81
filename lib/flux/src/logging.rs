//! Structured logging collaborator shared by every long-lived component in the workspace.
//!
//! Components never reach for a process-global logger. They are handed a [`Logger`] at
//! construction time and derive children from it with [`o!`] as they create sub-components,
//! so every log line carries the context of where it came from.

pub use slog::{self, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::Config;
use std::path::Path;

/// A sink configuration loaded from TOML, matching the shape accepted by `sloggers::LoggerConfig`.
pub type SinkConfig = sloggers::LoggerConfig;

/// Builds a root [`Logger`] from a TOML document.
///
/// Used by binaries at start-up; library code should never call this directly, only accept and
/// propagate a `Logger` handed to it.
pub fn from_toml_str(raw: &str) -> Result<Logger, serdeconv::Error> {
    let config: SinkConfig = serdeconv::from_toml_str(raw)?;
    config
        .build_logger()
        .map_err(|err| serdeconv::Error::from(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())))
}

/// Builds a root [`Logger`] from a TOML file on disk.
pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Logger, serdeconv::Error> {
    let config: SinkConfig = serdeconv::from_toml_file(path)?;
    config
        .build_logger()
        .map_err(|err| serdeconv::Error::from(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())))
}

/// A logger that discards everything. Used as a fallback when no logger was supplied and in
/// tests that don't care about log output.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// A terminal logger at the supplied level, for binaries that have not yet loaded their
/// configuration file.
pub fn terminal_default() -> Logger {
    from_toml_str(
        r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
    )
    .expect("default terminal logger config must be valid")
}
