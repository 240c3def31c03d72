use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::config::MuxConfig;
use crate::connection::Connection;
use crate::util::lock;

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

/// Maps (host, port) to the live [Connection] for that destination, so that all endpoints to
///  the same server share a single TCP connection.
///
/// A connection is created lazily by the first endpoint that asks for it, and it removes
///  itself when it is destroyed.
pub struct Registry {
    config: Arc<MuxConfig>,
    connections: Mutex<FxHashMap<(String, u16), Arc<Connection>>>,
    myself: Weak<Registry>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "REGISTRY{{{} connections}}", self.len())
    }
}

impl Registry {
    pub fn new(config: MuxConfig) -> anyhow::Result<Arc<Registry>> {
        config.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: MuxConfig) -> Arc<Registry> {
        Arc::new_cyclic(|myself| Registry {
            config: Arc::new(config),
            connections: Default::default(),
            myself: myself.clone(),
        })
    }

    /// The process-wide registry with default configuration, used by [crate::endpoint::Endpoint::new]
    pub fn global() -> Arc<Registry> {
        GLOBAL.get_or_init(|| Registry::with_valid_config(MuxConfig::default()))
            .clone()
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Returns the connection for (`host`, `port`) with an endpoint allocated on it, creating
    ///  the connection if there is none or if the existing one is being destroyed.
    pub(crate) fn get_connection(&self, host: &str, port: u16) -> Arc<Connection> {
        let mut connections = lock(&self.connections);
        let key = (host.to_string(), port);

        if let Some(connection) = connections.get(&key) {
            if connection.alloc_endpoint() {
                trace!("reusing connection to {}:{}", host, port);
                return connection.clone();
            }
        }

        debug!("creating connection to {}:{}", host, port);
        let connection = Connection::new(host, port, self.config.clone(), self.myself.clone());
        connection.alloc_endpoint();
        connections.insert(key, connection.clone());
        connection
    }

    /// Removes `connection`, but only if it is still the one registered for its destination
    pub(crate) fn remove(&self, connection: &Connection) {
        let mut connections = lock(&self.connections);
        let key = (connection.host().to_string(), connection.port());
        if connections.get(&key).is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), connection)) {
            connections.remove(&key);
            debug!("removed connection to {}:{}, {} left", key.0, key.1, connections.len());
        }
    }

    pub fn connection(&self, host: &str, port: u16) -> Option<Arc<Connection>> {
        lock(&self.connections)
            .get(&(host.to_string(), port))
            .cloned()
    }

    pub fn contains(&self, host: &str, port: u16) -> bool {
        lock(&self.connections).contains_key(&(host.to_string(), port))
    }

    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.connections).is_empty()
    }
}
