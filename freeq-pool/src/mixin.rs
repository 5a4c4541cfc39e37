//! Behaviour extensions attached to the client and to every connection it
//! opens.

use std::sync::Arc;

use crate::client::ChatClient;
use crate::connection::Connection;

/// Applied once, to the client, by [`ChatClient::use_mixin`].
///
/// A mixin that also needs per-connection hooks registers itself with
/// [`ChatClient::add_connection_mixin`] from here.
pub trait ClientMixin: Send + Sync {
    fn apply_to_client(self: Arc<Self>, client: &ChatClient);
}

/// Applied to every new connection before its connect sequence starts, so it
/// observes the connection's first event.
///
/// Runs while the client's pool is locked: implementations may subscribe to
/// or configure `conn`, but must not call back into the client.
pub trait ConnectionMixin: Send + Sync {
    fn apply_to_connection(self: Arc<Self>, conn: &Arc<Connection>);
}

/// Connection mixins in registration order.
#[derive(Default, Clone)]
pub(crate) struct MixinRegistry {
    connection_mixins: Vec<Arc<dyn ConnectionMixin>>,
}

impl MixinRegistry {
    pub fn push(&mut self, mixin: Arc<dyn ConnectionMixin>) {
        self.connection_mixins.push(mixin);
    }

    pub fn len(&self) -> usize {
        self.connection_mixins.len()
    }

    /// Replay every registered mixin on `conn`, in order.
    pub fn apply_all(&self, conn: &Arc<Connection>) {
        for mixin in &self.connection_mixins {
            Arc::clone(mixin).apply_to_connection(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::MemoryConnector;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ConnectionMixin for Recorder {
        fn apply_to_connection(self: Arc<Self>, conn: &Arc<Connection>) {
            self.log.lock().push(format!("{}@{}", self.name, conn.id()));
        }
    }

    #[test]
    fn replays_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = MixinRegistry::default();
        for name in ["first", "second", "third"] {
            registry.push(Arc::new(Recorder {
                name,
                log: log.clone(),
            }));
        }
        assert_eq!(registry.len(), 3);

        let (connector, _peers) = MemoryConnector::new();
        let conn = Connection::new(Arc::new(ClientConfig::default()), Arc::new(connector));
        registry.apply_all(&conn);

        let id = conn.id();
        assert_eq!(
            *log.lock(),
            vec![format!("first@{id}"), format!("second@{id}"), format!("third@{id}")]
        );
    }
}
