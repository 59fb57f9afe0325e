pub mod connection;
pub mod dispatcher;
pub mod presence;
pub mod verifier;

use std::sync::Arc;

use atrium_store::Database;

use crate::dispatcher::Dispatcher;
use crate::presence::PresenceRegistry;

/// Shared gateway state handed to every connection.
#[derive(Clone)]
pub struct Gateway {
    pub dispatcher: Dispatcher,
    pub presence: PresenceRegistry,
    pub db: Arc<Database>,
}

impl Gateway {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            presence: PresenceRegistry::new(),
            db,
        }
    }
}
