#![deny(missing_docs)]
//! vigil_core: shared building blocks (config, offline store, logging, activity and job model).

/// Configuration helpers (AppId, dirs, load_or_init, validation).
pub mod cfg;
/// File-backed KV store and the offline delivery queue built on it.
pub mod store;
/// Tracing/log initialization helpers.
pub mod logx;
/// Activity definitions and the command whitelist.
pub mod activity;
/// Job state machine and delivery records shared by the engine and tools.
pub mod job;

/// Milliseconds since the Unix epoch, saturating to zero on clock skew.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
