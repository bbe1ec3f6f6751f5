use log::LevelFilter;

/// Initializes the process-wide logger. `RUST_LOG` overrides the CLI
/// verbosity when set.
pub fn init(verbosity: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(verbosity)
        .format_timestamp_millis()
        .parse_default_env()
        .init();
}
