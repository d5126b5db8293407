//! Shared application state.

use std::sync::Arc;

use crate::directory::Directory;
use crate::limiter::RateLimiter;
use crate::room::Rooms;
use crate::storage::SharedStore;
use crate::terminal::TerminalManager;

#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<Directory>,
    pub store: SharedStore,
    pub limiter: Arc<RateLimiter>,
    pub rooms: Arc<Rooms>,
    pub terminals: Arc<TerminalManager>,
}

impl AppState {
    pub fn new(store: SharedStore, terminals: Arc<TerminalManager>) -> Self {
        Self {
            directory: Arc::new(Directory::new()),
            store,
            limiter: Arc::new(RateLimiter::new()),
            rooms: Arc::new(Rooms::new(terminals.clone())),
            terminals,
        }
    }
}
