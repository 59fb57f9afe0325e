pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod notifications;

use std::sync::Arc;

use atrium_gateway::Gateway;
use atrium_store::Database;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub gateway: Gateway,
}
