use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` adds to the default
/// `mastr_ingest=info` directive.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "mastr_ingest=info".parse() {
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
