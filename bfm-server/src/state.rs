//! Shared application state handed to every handler.

use std::path::PathBuf;
use std::sync::Arc;

use bfm_core::executor::Executor;

#[derive(Clone)]
pub struct AppState {
    /// The execution engine; owns registry, tracker, drivers, connections.
    pub executor: Arc<Executor>,
    /// Script corpus root, for reindex requests.
    pub scripts_root: PathBuf,
    /// Bearer token callers must present on `/api/v1`.
    pub api_token: Arc<String>,
}

impl AppState {
    pub fn new(executor: Arc<Executor>, scripts_root: PathBuf, api_token: String) -> Self {
        Self {
            executor,
            scripts_root,
            api_token: Arc::new(api_token),
        }
    }
}
