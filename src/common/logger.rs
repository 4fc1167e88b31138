use env_logger::{Builder, Env};
use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the global logger at most once. Tests call this before anything
/// else so the page, latch, and split tracing is visible; raise the level
/// with e.g. `RUST_LOG=magnetite=trace`.
pub fn initialize_logger() {
    INIT.call_once(|| {
        let env = Env::default().default_filter_or("magnetite=info");
        let mut builder = Builder::from_env(env);
        builder.format_timestamp(None).is_test(true);
        // A logger may already be installed when the crate is embedded.
        let _ = builder.try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_initialization_is_harmless() {
        initialize_logger();
        initialize_logger();
        log::debug!("logger ready");
    }
}
