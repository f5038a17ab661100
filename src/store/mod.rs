pub mod bootstrap;
pub mod pool;
pub mod valkey;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::hub::AgentHub;
use crate::proxy::VncRouter;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub hub: Arc<AgentHub>,
    pub vnc: Arc<VncRouter>,
    pub config: Arc<Config>,
}
