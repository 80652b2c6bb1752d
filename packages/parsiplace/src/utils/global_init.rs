use log::LevelFilter;

/// One-time process setup: pretty error reports for the whole binary.
pub fn global_init() {
  color_eyre::install().expect("color_eyre initialization failed");
}

/// Configures the logger backend. Call once, early in `main()`.
pub fn setup_logger(filter_level: LevelFilter) {
  env_logger::Builder::new()
    .filter_level(filter_level)
    .format_timestamp_secs()
    .format_module_path(false)
    .parse_default_env()
    .init();
}
