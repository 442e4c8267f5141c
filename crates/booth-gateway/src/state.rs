use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::FromRef;
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::config::GatewayConfig;
use crate::store::RoomStore;

/// Participant ids with a joined signaling socket.
pub type ConnectionMap = Arc<RwLock<HashSet<String>>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<GatewayConfig>,
    pub rooms: RoomStore,
    pub connections: ConnectionMap,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: GatewayConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            rooms: RoomStore::new(),
            connections: Arc::new(RwLock::new(HashSet::new())),
        }
    }
}

impl FromRef<AppState> for SqlitePool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Arc<GatewayConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl FromRef<AppState> for RoomStore {
    fn from_ref(state: &AppState) -> Self {
        state.rooms.clone()
    }
}

impl FromRef<AppState> for ConnectionMap {
    fn from_ref(state: &AppState) -> Self {
        state.connections.clone()
    }
}
