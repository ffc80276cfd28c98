use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use vigil_core::activity::Activity;
use vigil_core::cfg::Config;
use vigil_core::store::Store;

/// Shared context handed to every module at spawn time.
#[derive(Clone)]
pub struct ModuleCtx {
    /// Flips to `true` once when the agent stops.
    pub shutdown: watch::Receiver<bool>,
    /// Delivery sink for finalized records.
    pub store: Arc<dyn Store>,
    /// Config snapshot the agent started with.
    pub config: Arc<Config>,
    /// Latest full activity list (`activitiesChanged`).
    pub activities: watch::Receiver<Vec<Activity>>,
}

/// A long-running part of the agent.
pub trait Module: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;
    /// Start the module on the runtime.
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}

/// Resolve once shutdown is requested or the sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
