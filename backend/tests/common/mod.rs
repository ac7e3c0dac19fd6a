// Shared setup for the integration tests
use std::sync::Once;

static INIT: Once = Once::new();

/// Route engine logs to the test writer once per binary
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("flowdesk_backend=debug,tower_http=info")
            .try_init()
            .ok();
    });
}
