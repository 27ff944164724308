// Shared setup for integration tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes logging once for the whole test binary. Honors RUST_LOG.
pub fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
