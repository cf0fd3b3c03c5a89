use std::sync::Arc;

use crate::config::Config;
use crate::service::SyncService;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub service: Arc<SyncService>,
    pub config: Config,
}
