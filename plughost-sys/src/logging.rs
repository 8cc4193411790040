//! Log output configuration for the runtime and its guests.

use crate::error::Error;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber.
///
/// `target` is `stdout`, `stderr`, or a file path (appended to). `filter`
/// accepts `EnvFilter` directives such as `info` or
/// `plughost_sys=debug,plughost::guest=trace`. Fails if a global subscriber
/// is already installed.
pub fn set_log_file(target: &str, filter: &str) -> Result<(), Error> {
    let filter = EnvFilter::try_new(filter).map_err(|e| Error::Logging(e.to_string()))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = match target {
        "stdout" => builder.with_writer(std::io::stdout).try_init(),
        "stderr" => builder.with_writer(std::io::stderr).try_init(),
        path => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
    };
    installed.map_err(|e| Error::Logging(e.to_string()))
}
