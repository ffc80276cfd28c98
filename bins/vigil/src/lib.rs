//! vigil: host monitoring agent runtime (execution engine, workers, scheduler).

pub mod executor;
pub mod module;
pub mod plugin;
pub mod pool;
pub mod protocol;
pub mod scheduler;
#[cfg(feature = "web-api")]
pub mod status;
