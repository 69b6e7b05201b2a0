//! Shared application state
//!
//! One launcher and one bridge per server process, constructed in `main` and
//! torn down with it. Handlers get both through axum's `State`.

use std::sync::Arc;

use crate::bridge::MessageBridge;
use crate::launcher::ProcessLauncher;

pub struct AppState {
    pub launcher: Arc<ProcessLauncher>,
    pub bridge: Arc<MessageBridge>,
}
