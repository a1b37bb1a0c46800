use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    Stdout,
    Stderr,
}

/// Initialize logging to the given output, with a `RUST_LOG`-style
/// environment filter on top of `default_level`.
///
/// Must run before any thread starts logging; the subscriber is installed
/// process-wide.
pub fn init(default_level: &str, output: Output) -> anyhow::Result<()> {
    // We fall back to printing all spans at `default_level` or above if
    // the RUST_LOG environment variable is not set.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let base_logger = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(move || -> Box<dyn std::io::Write> {
            match output {
                Output::Stdout => Box::new(std::io::stdout()),
                Output::Stderr => Box::new(std::io::stderr()),
            }
        });

    base_logger
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to initialize the logging subscriber")?;

    Ok(())
}
