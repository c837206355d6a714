use std::sync::{Mutex, OnceLock};

use mio::Token;
use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::connection::Connection;

/// A set of [`Connection`] values keyed by `host:port`.
///
/// Lookup by address (used by the publisher) and by event-loop token (used
/// by the subscriber, see Open Question b in the design notes) are both
/// linear scans: pool sizes here are broker counts, not request volumes,
/// so a `HashMap` buys nothing a `Vec` doesn't already give for free, and
/// the `Vec` also makes `shuffle` and ordered iteration trivial.
pub struct ConnectionPool {
    connections: Vec<Connection>,
}

impl ConnectionPool {
    pub fn new() -> ConnectionPool {
        ConnectionPool {
            connections: Vec::new(),
        }
    }

    pub fn add(&mut self, conn: Connection) {
        self.connections.push(conn);
    }

    pub fn find_by_address(&self, address: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.address() == address)
    }

    pub fn find_by_address_mut(&mut self, address: &str) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.address() == address)
    }

    pub fn find_by_token(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.token() == Some(token))
    }

    pub fn remove_by_token(&mut self, token: Token) -> Option<Connection> {
        let idx = self.connections.iter().position(|c| c.token() == Some(token))?;
        Some(self.connections.remove(idx))
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn shuffle(&mut self) {
        self.connections.shuffle(&mut thread_rng());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.iter_mut()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.address().to_owned()).collect()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        ConnectionPool::new()
    }
}

/// The process-wide publisher pool singleton.
///
/// Preserved deliberately from the source design: multiple `Client`
/// instances in the same process that call `publish_to` with overlapping
/// addresses share the underlying connections. `reset_for_test` exists so
/// test cases don't bleed connections into each other; it is not meant for
/// production use.
pub struct ConnectionManager;

static PUBLISH_POOL: OnceLock<Mutex<ConnectionPool>> = OnceLock::new();

impl ConnectionManager {
    pub fn instance() -> &'static Mutex<ConnectionPool> {
        PUBLISH_POOL.get_or_init(|| Mutex::new(ConnectionPool::new()))
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn reset_for_test() {
        let mut pool = Self::instance().lock().expect("publish pool mutex poisoned");
        *pool = ConnectionPool::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::send_magic;
    use std::net::TcpListener;
    use std::time::Duration;

    fn accept_one(listener: TcpListener) {
        std::thread::spawn(move || {
            let _ = listener.accept();
        });
    }

    #[test]
    fn pool_counts_and_finds_by_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        accept_one(listener);

        let conn = Connection::connect_blocking(
            &addr,
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
            send_magic,
        )
        .unwrap();

        let mut pool = ConnectionPool::new();
        pool.add(conn);

        assert_eq!(1, pool.count());
        assert!(pool.find_by_address(&addr).is_some());
        assert!(pool.find_by_address("127.0.0.1:1").is_none());
    }

    #[test]
    fn manager_instance_is_a_process_wide_singleton() {
        ConnectionManager::reset_for_test();
        let a = ConnectionManager::instance() as *const Mutex<ConnectionPool>;
        let b = ConnectionManager::instance() as *const Mutex<ConnectionPool>;
        assert_eq!(a, b);
    }
}
