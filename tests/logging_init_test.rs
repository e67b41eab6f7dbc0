//! Global subscriber installation.
//!
//! Lives in its own test binary: installing a global subscriber inside the
//! library's unit tests would swallow the per-test capture used there.

use nexus_writer::logging::{self, LoggingConfig, OutputFormat};
use serial_test::serial;
use tracing::Level;

#[test]
#[serial]
fn test_init_is_idempotent() {
    let config = LoggingConfig {
        level: Level::ERROR,
        format: OutputFormat::Compact,
    };
    assert!(logging::init(config).is_ok());
    assert!(tracing::dispatcher::has_been_set());
    assert!(logging::init(config).is_ok());

    let json = LoggingConfig {
        format: OutputFormat::Json,
        ..config
    };
    assert!(logging::init(json).is_ok());
}
