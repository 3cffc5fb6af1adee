use std::time::Duration;

/// Default location of the gate configuration
pub const DEFAULT_CONFIG_PATH: &str = "config/pa_gate.toml";

/// Command-line options for the gate binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    /// Path to the TOML configuration
    pub config_path: String,
    /// Log to file only
    pub quiet: bool,
    /// Stop on its own after this long, otherwise run until Ctrl+C
    pub run_for: Option<Duration>,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self { config_path: DEFAULT_CONFIG_PATH.to_string(), quiet: false, run_for: None }
    }
}

/// Parses `[config_path] [--quiet] [--run-for <secs>]`
///
/// Unknown flags are ignored with a warning so a stale wrapper script does
/// not stop the gate from starting.
pub fn parse<I>(args: I) -> CliArgs
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--quiet" | "-q" => parsed.quiet = true,
            "--run-for" => match args.next().and_then(|secs| secs.parse::<u64>().ok()) {
                Some(secs) => parsed.run_for = Some(Duration::from_secs(secs)),
                None => tracing::warn!("--run-for expects a number of seconds"),
            },
            flag if flag.starts_with('-') => tracing::warn!("Ignoring unknown flag {flag}"),
            path => parsed.config_path = path.to_string(),
        }
    }

    parsed
}

/// Parses the process arguments, skipping the program name
pub fn from_env() -> CliArgs {
    parse(std::env::args().skip(1))
}
