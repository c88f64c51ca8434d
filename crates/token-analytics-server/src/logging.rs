use log::LevelFilter;

/// Installs env_logger at `info` (`debug` with `--debug`). `RUST_LOG`
/// directives are applied on top, so they can still raise or silence a module.
pub fn init_logging(debug: bool, directives: Option<&str>) {
    builder(debug, directives).init();
}

fn builder(debug: bool, directives: Option<&str>) -> env_logger::Builder {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        .filter_module("redis", LevelFilter::Warn)
        .format_timestamp_millis()
        .format_module_path(false);
    if let Some(directives) = directives.filter(|d| !d.trim().is_empty()) {
        builder.parse_filters(directives);
    }
    builder
}
