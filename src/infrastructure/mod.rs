//! Infrastructure adapters: configuration, logging, the HTTP model
//! provider, session persistence, and live telemetry.

pub mod config;
pub mod logging;
pub mod provider;
pub mod session;
pub mod telemetry;

pub use config::ConfigLoader;
pub use session::SqliteSessionStore;
pub use telemetry::{read_events_since, LiveState, TelemetryWriter};
