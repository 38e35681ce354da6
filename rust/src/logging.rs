/// Tracing initialization for embedding apps and tests.
///
/// Called once at the start of `ChatEngine::new()`. Uses `try_init` so a
/// host application that already installed a subscriber, or a test binary
/// constructing several engines, never panics on double-init.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "barter_core=debug,info".into()),
        )
        .try_init();
}
