use crate::database::{CollectionRef, DatabaseClient};
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;
use url::Url;

pub type Generation = u64;

/// One fully built connection. Never mutated: a key rotation publishes a new
/// state with a higher generation.
pub struct ConnectionState {
    pub client: Arc<dyn DatabaseClient>,
    pub endpoint: Url,
    pub database: String,
    pub collection: String,
    pub generation: Generation,
}

impl ConnectionState {
    pub fn target(&self) -> CollectionRef<'_> {
        CollectionRef {
            database: &self.database,
            collection: &self.collection,
        }
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("endpoint", &self.endpoint.as_str())
            .field("database", &self.database)
            .field("collection", &self.collection)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Process-wide holder of the current connection. Reads are lock free;
/// publishing is a single pointer swap.
#[derive(Clone)]
pub struct ConnectionHolder {
    current: Arc<ArcSwap<ConnectionState>>,
}

impl ConnectionHolder {
    pub fn new(state: ConnectionState) -> Self {
        ConnectionHolder {
            current: Arc::new(ArcSwap::from_pointee(state)),
        }
    }

    pub fn current(&self) -> Arc<ConnectionState> {
        self.current.load_full()
    }

    pub fn generation(&self) -> Generation {
        self.current.load().generation
    }

    /// Only the reconnector's leader publishes, after validation succeeded.
    pub(crate) fn publish(&self, state: ConnectionState) {
        self.current.store(Arc::new(state));
    }
}
