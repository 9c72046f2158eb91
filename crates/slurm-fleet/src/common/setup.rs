use anyhow::Context;
use env_logger::{DEFAULT_FILTER_ENV, Target, WriteStyle};
use log::LevelFilter;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Sets the behavior of the logger, based on passed environment variables
/// such as `RUST_LOG`.
///
/// Slurm throws away the standard output of its power saving programs, so the log can be
/// redirected (appended) into `log_file`.
pub fn setup_logging(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let has_debug = std::env::var(DEFAULT_FILTER_ENV)
        .map(|v| v.contains("debug"))
        .unwrap_or(false);

    if verbose || has_debug {
        builder.format_timestamp_millis();
    } else {
        // Shortened format
        // <time> <level> <pid> <message>
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} {} [{}] {}",
                buf.timestamp_seconds(),
                record.level(),
                std::process::id(),
                record.args()
            )
        });
    }

    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Cannot open log file {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(file)));
        builder.write_style(WriteStyle::Never);
    }

    // Overwrite the defaults from env
    builder.parse_default_env();
    builder.init();
    Ok(())
}
