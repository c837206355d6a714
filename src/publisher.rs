use std::time::Duration;

use log::{debug, warn};

use crate::connection::{canonical_address, send_magic, Connection};
use crate::error::NsqError;
use crate::frame::{self, is_error, is_heartbeat, is_ok};
use crate::pool::ConnectionManager;

/// How many broker nodes must confirm a publish before it is considered
/// successful. `Quorum` is a sentinel value (5); its semantic meaning is
/// `ceil(N / 2) + 1` for the current pool size `N`, resolved at
/// `publish_to` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    One,
    Two,
    Quorum,
}

impl ConsistencyLevel {
    fn required_for(self, pool_size: usize) -> usize {
        match self {
            ConsistencyLevel::One => 1,
            ConsistencyLevel::Two => 2,
            ConsistencyLevel::Quorum => pool_size / 2 + 1,
        }
    }
}

/// Accepts either a single comma-separated string or a collection of
/// individual host entries, the way `publish_to` is documented to.
pub trait IntoHosts {
    fn into_hosts(self) -> Vec<String>;
}

impl IntoHosts for &str {
    fn into_hosts(self) -> Vec<String> {
        self.split(',').map(|s| s.trim().to_owned()).filter(|s| !s.is_empty()).collect()
    }
}

impl IntoHosts for String {
    fn into_hosts(self) -> Vec<String> {
        self.as_str().into_hosts()
    }
}

impl IntoHosts for Vec<String> {
    fn into_hosts(self) -> Vec<String> {
        self
    }
}

impl IntoHosts for &[String] {
    fn into_hosts(self) -> Vec<String> {
        self.to_vec()
    }
}

impl IntoHosts for Vec<&str> {
    fn into_hosts(self) -> Vec<String> {
        self.into_iter().map(|s| s.to_owned()).collect()
    }
}

/// A resolved publish plan: which addresses to write to and how many of
/// them must confirm `OK`.
struct PublishPlan {
    required: usize,
}

/// Publishes messages to a configured set of broker nodes with bounded
/// per-node retries, stopping as soon as the consistency floor is met.
/// Publish-side connections live in the process-wide singleton pool (see
/// [`ConnectionManager`]), so multiple `Publisher`s in the same process
/// sharing addresses share connections too.
pub struct Publisher {
    connect_timeout: Duration,
    read_write_timeout: Duration,
    read_wait_timeout: Duration,
    plan: Option<PublishPlan>,
}

impl Publisher {
    pub fn new(connect_timeout: Duration, read_write_timeout: Duration, read_wait_timeout: Duration) -> Publisher {
        Publisher {
            connect_timeout,
            read_write_timeout,
            read_wait_timeout,
            plan: None,
        }
    }

    pub fn publish_to(&mut self, hosts: impl IntoHosts, level: ConsistencyLevel) -> Result<(), NsqError> {
        let addresses: Vec<String> = hosts.into_hosts().iter().map(|h| canonical_address(h)).collect();

        if addresses.is_empty() {
            return Err(NsqError::configuration("publish_to requires at least one host"));
        }

        {
            let mut pool = ConnectionManager::instance().lock().expect("publish pool mutex poisoned");
            for address in &addresses {
                if pool.find_by_address(address).is_some() {
                    continue;
                }

                let conn = Connection::connect_blocking(
                    address,
                    self.connect_timeout,
                    self.read_write_timeout,
                    self.read_wait_timeout,
                    send_magic,
                )?;
                pool.add(conn);
            }

            let pool_size = pool.count();
            let required = level.required_for(pool_size);

            if required > pool_size {
                return Err(NsqError::configuration(format!(
                    "cannot achieve desired consistency with {} nodes (requires {})",
                    pool_size, required
                )));
            }

            self.plan = Some(PublishPlan { required });
        }

        Ok(())
    }

    pub fn publish(&self, topic: &str, body: &[u8]) -> Result<usize, NsqError> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| NsqError::configuration("publish_to must be called before publish"))?;

        let mut pool = ConnectionManager::instance().lock().expect("publish pool mutex poisoned");
        pool.shuffle();

        let mut success = 0usize;
        let mut errors = Vec::new();

        let addresses = pool.addresses();
        for address in addresses {
            if success >= plan.required {
                break;
            }

            let conn = match pool.find_by_address_mut(&address) {
                Some(c) => c,
                None => continue,
            };

            match try_func(conn, 2, |c| publish_attempt(c, topic, body)) {
                Ok(()) => success += 1,
                Err(e) => {
                    warn!("publish to {} failed: {}", address, e);
                    errors.push(format!("{}: {}", address, e));
                }
            }
        }

        if success < plan.required {
            return Err(NsqError::Publish {
                required: plan.required,
                achieved: success,
                errors,
            });
        }

        Ok(success)
    }
}

fn publish_attempt(conn: &mut Connection, topic: &str, body: &[u8]) -> Result<(), NsqError> {
    conn.write(&frame::encode_pub(topic, body))?;

    loop {
        let frame = conn
            .read_frame()?
            .ok_or_else(|| NsqError::protocol("blocking connection reported no frame available"))?;

        if is_heartbeat(&frame) {
            debug!("publish: heartbeat, replying NOP");
            conn.write(&frame::encode_nop())?;
            continue;
        }

        if is_ok(&frame) {
            return Ok(());
        }

        if is_error(&frame) {
            return Err(NsqError::protocol_frame("broker returned an error frame", &frame));
        }

        return Err(NsqError::protocol_frame("unexpected frame during publish", &frame));
    }
}

/// Invokes `f(connection)` at most `tries + 1` times total. On any failure,
/// reconnects unconditionally (recovering from half-open TCP state as well
/// as from application-level errors) and tries again; the final failure is
/// propagated.
fn try_func<F>(conn: &mut Connection, tries: u32, mut f: F) -> Result<(), NsqError>
where
    F: FnMut(&mut Connection) -> Result<(), NsqError>,
{
    let mut attempt = 0;

    loop {
        match f(conn) {
            Ok(()) => return Ok(()),
            Err(err) => {
                if attempt == tries {
                    return Err(err);
                }

                if let Err(reconnect_err) = conn.reconnect() {
                    warn!("reconnect to {} failed: {}", conn.address(), reconnect_err);
                }

                attempt += 1;
            }
        }
    }
}
