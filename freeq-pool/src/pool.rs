//! Ordered set of live connections plus the whisper affinity slot.
//!
//! Only [`ChatClient`](crate::ChatClient) holds a `Pool`, behind its own
//! mutex; nothing here awaits.

use std::collections::HashSet;
use std::sync::Arc;

use crate::connection::{Connection, ConnectionId};

#[derive(Default)]
pub struct Pool {
    connections: Vec<Arc<Connection>>,
    pub(crate) whisper: WhisperAffinity,
    pub(crate) closed: bool,
}

impl Pool {
    /// First live connection matching `predicate`, moved to the end so
    /// repeated selections spread over the pool.
    pub fn select<F>(&mut self, predicate: F) -> Option<Arc<Connection>>
    where
        F: Fn(&Connection) -> bool,
    {
        find_and_push_to_end(&mut self.connections, |c| !c.is_closed() && predicate(c.as_ref())).cloned()
    }

    pub fn push(&mut self, conn: Arc<Connection>) {
        debug_assert!(self.connections.iter().all(|c| c.id() != conn.id()));
        self.connections.push(conn);
    }

    /// Remove a connection; `false` if it was not in the pool.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c.id() != id);
        self.connections.len() != before
    }

    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn any_wants(&self, channel: &str) -> bool {
        self.connections.iter().any(|c| c.wants(channel))
    }

    pub fn wanted_channels(&self) -> HashSet<String> {
        self.connections
            .iter()
            .flat_map(|c| c.wanted_channels())
            .collect()
    }

    pub fn joined_channels(&self) -> HashSet<String> {
        self.connections
            .iter()
            .flat_map(|c| c.joined_channels())
            .collect()
    }
}

/// Move the first element matching `predicate` to the end of `items` and
/// return it.
pub fn find_and_push_to_end<T, F>(items: &mut Vec<T>, predicate: F) -> Option<&T>
where
    F: Fn(&T) -> bool,
{
    let idx = items.iter().position(predicate)?;
    let item = items.remove(idx);
    items.push(item);
    items.last()
}

/// Which connection's `WHISPER`s reach subscribers.
#[derive(Debug, Default)]
pub struct WhisperAffinity {
    holder: Option<ConnectionId>,
}

impl WhisperAffinity {
    /// Whether a whisper from `from` should be forwarded. Claims the slot if
    /// it is free.
    pub fn admit(&mut self, from: ConnectionId) -> bool {
        *self.holder.get_or_insert(from) == from
    }

    /// Free the slot if `id` holds it.
    pub fn release(&mut self, id: ConnectionId) {
        if self.holder == Some(id) {
            self.holder = None;
        }
    }

    pub fn holder(&self) -> Option<ConnectionId> {
        self.holder
    }
}

/// Selection predicate: the connection can take at least one more channel.
pub fn below_ceiling(ceiling: usize) -> impl Fn(&Connection) -> bool {
    move |c| c.wanted_count() < ceiling
}

/// Selection predicate for `say`/`me`: the connection is not in `channel`.
pub fn not_in_channel(channel: &str) -> impl Fn(&Connection) -> bool + '_ {
    move |c| !c.wants(channel) && !c.has_joined(channel)
}

pub fn remaining_capacity(conn: &Connection, ceiling: usize) -> usize {
    ceiling.saturating_sub(conn.wanted_count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::MemoryConnector;

    fn conn() -> Arc<Connection> {
        let (connector, _peers) = MemoryConnector::new();
        Connection::new(Arc::new(ClientConfig::default()), Arc::new(connector))
    }

    fn ids(pool: &Pool) -> Vec<ConnectionId> {
        pool.connections().iter().map(|c| c.id()).collect()
    }

    #[test]
    fn find_and_push_to_end_reorders() {
        let mut items = vec![1, 2, 3, 4];
        assert_eq!(find_and_push_to_end(&mut items, |&x| x % 2 == 0), Some(&2));
        assert_eq!(items, vec![1, 3, 4, 2]);
        assert_eq!(find_and_push_to_end(&mut items, |&x| x > 10), None);
        assert_eq!(items, vec![1, 3, 4, 2]);
    }

    #[test]
    fn selection_moves_connection_to_end() {
        let (a, b, c) = (conn(), conn(), conn());
        let mut pool = Pool::default();
        for x in [&a, &b, &c] {
            pool.push(Arc::clone(x));
        }

        let picked = pool.select(|_| true).unwrap();
        assert_eq!(picked.id(), a.id());
        assert_eq!(ids(&pool), vec![b.id(), c.id(), a.id()]);

        let picked = pool.select(|x| x.id() == c.id()).unwrap();
        assert_eq!(picked.id(), c.id());
        assert_eq!(ids(&pool), vec![b.id(), a.id(), c.id()]);
    }

    #[test]
    fn selection_skips_closed_connections() {
        let (a, b) = (conn(), conn());
        let mut pool = Pool::default();
        pool.push(Arc::clone(&a));
        pool.push(Arc::clone(&b));
        a.close();

        assert_eq!(pool.select(|_| true).unwrap().id(), b.id());
        assert!(pool.remove(a.id()));
        assert!(!pool.remove(a.id()));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn capacity_predicates() {
        let a = conn();
        a.reserve_wanted(&["x".to_string(), "y".to_string()]).unwrap();
        assert!(!below_ceiling(2)(&a));
        assert!(below_ceiling(3)(&a));
        assert_eq!(remaining_capacity(&a, 5), 3);
        assert_eq!(remaining_capacity(&a, 1), 0);
        assert!(!not_in_channel("x")(&a));
        assert!(not_in_channel("z")(&a));
    }

    #[test]
    fn channel_unions_are_live() {
        let (a, b) = (conn(), conn());
        let mut pool = Pool::default();
        pool.push(Arc::clone(&a));
        pool.push(Arc::clone(&b));
        a.reserve_wanted(&["x".to_string()]).unwrap();
        b.reserve_wanted(&["y".to_string(), "x".to_string()]).unwrap();

        let wanted = pool.wanted_channels();
        assert_eq!(wanted.len(), 2);
        assert!(pool.any_wants("y"));

        pool.remove(b.id());
        assert_eq!(pool.wanted_channels(), HashSet::from(["x".to_string()]));
        assert!(pool.joined_channels().is_empty());
    }

    #[test]
    fn whisper_affinity_first_claimer_wins() {
        let mut slot = WhisperAffinity::default();
        let (a, b) = (ConnectionId(1), ConnectionId(2));

        assert!(slot.admit(a));
        assert!(!slot.admit(b));
        assert!(slot.admit(a));

        slot.release(b);
        assert_eq!(slot.holder(), Some(a));
        slot.release(a);
        assert_eq!(slot.holder(), None);

        assert!(slot.admit(b));
        assert!(!slot.admit(a));
    }
}
