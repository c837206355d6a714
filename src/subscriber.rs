use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use mio::deprecated::{EventLoop, Handler};
use mio::{PollOpt, Ready as EventSet, Token};
use serde_json::Value;

use crate::connection::{canonical_address, send_magic, Connection};
use crate::error::{CallbackOutcome, NsqError};
use crate::frame::{self, is_error, is_heartbeat, is_message, is_ok, Frame};
use crate::global::IdSequence;
use crate::message::Message;
use crate::pool::ConnectionPool;
use crate::traits::{DedupeService, RequeueStrategy};

static TOPIC_CHANNEL_PATTERN_DESC: &str = "[.a-zA-Z0-9_-]{2,32}";

pub type Callback = Box<dyn FnMut(&Message) -> CallbackOutcome>;
type SharedCallback = Rc<RefCell<dyn FnMut(&Message) -> CallbackOutcome>>;

/// Cross-thread control messages posted onto the event loop's channel, so
/// `Client::stop` works whether called from the loop thread (inside a
/// callback) or from any other thread.
pub enum ControlSignal {
    Stop,
}

struct Subscription {
    topic: String,
    channel: String,
    callback: SharedCallback,
}

/// Owns every subscribe-side connection and drives the per-connection
/// protocol handler on read readiness. One `Dispatcher` backs one `Client`;
/// it implements `mio::Handler` so the event loop can call straight into
/// it without an intervening channel.
pub struct Dispatcher {
    pool: ConnectionPool,
    subscriptions: HashMap<Token, Subscription>,
    id_seq: IdSequence,
    dedupe: Option<Arc<dyn DedupeService + Send + Sync>>,
    requeue_strategy: Option<Arc<dyn RequeueStrategy + Send + Sync>>,
    fatal_error: Option<NsqError>,
}

impl Dispatcher {
    pub fn new(
        dedupe: Option<Arc<dyn DedupeService + Send + Sync>>,
        requeue_strategy: Option<Arc<dyn RequeueStrategy + Send + Sync>>,
    ) -> Dispatcher {
        Dispatcher {
            pool: ConnectionPool::new(),
            subscriptions: HashMap::new(),
            id_seq: IdSequence::new(),
            dedupe,
            requeue_strategy,
            fatal_error: None,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ConnectionPool {
        &mut self.pool
    }

    pub fn take_fatal_error(&mut self) -> Option<NsqError> {
        self.fatal_error.take()
    }

    /// Opens one non-blocking connection per discovered endpoint, performs
    /// the MAGIC/IDENTIFY/SUB/RDY handshake synchronously, and registers
    /// each socket with the event loop for read readiness. Subsequent
    /// frames are handled from `ready` once `run` drives the loop.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &mut self,
        event_loop: &mut EventLoop<Dispatcher>,
        topic: &str,
        channel: &str,
        hosts: &[String],
        params: Option<Value>,
        callback: impl FnMut(&Message) -> CallbackOutcome + 'static,
        connect_timeout: Duration,
        read_write_timeout: Duration,
        read_wait_timeout: Duration,
    ) -> Result<(), NsqError> {
        validate_name("topic", topic)?;
        validate_name("channel", channel)?;

        let shared: SharedCallback = Rc::new(RefCell::new(callback));

        for host in hosts {
            let address = canonical_address(host);
            let mut conn = Connection::connect_nonblocking(
                &address,
                connect_timeout,
                read_write_timeout,
                read_wait_timeout,
                send_magic,
            )?;

            if let Some(params) = &params {
                conn.write(&frame::encode_identify(params)?)?;
            }

            let token = Token(self.id_seq.next());
            conn.set_token(token);
            conn.write(&frame::encode_sub(topic, channel))?;
            conn.write(&frame::encode_rdy(1))?;

            register_for_read(event_loop, &conn, token)?;

            self.pool.add(conn);
            self.subscriptions.insert(
                token,
                Subscription {
                    topic: topic.to_owned(),
                    channel: channel.to_owned(),
                    callback: shared.clone(),
                },
            );
        }

        Ok(())
    }

    fn dispatch_one(&mut self, token: Token) -> Result<(), NsqError> {
        let frame = {
            let conn = self
                .pool
                .find_by_token(token)
                .ok_or_else(|| NsqError::protocol("frame readiness on an unknown connection"))?;

            match conn.read_frame()? {
                Some(frame) => frame,
                None => return Ok(()),
            }
        };

        if is_heartbeat(&frame) {
            debug!("heartbeat on {:?}, replying NOP", token);
            let conn = self.pool.find_by_token(token).expect("looked up above");
            return conn.write(&frame::encode_nop());
        }

        if is_ok(&frame) {
            debug!("OK on {:?} (echo of SUB/IDENTIFY)", token);
            return Ok(());
        }

        if is_message(&frame) {
            return self.handle_message(token, &frame);
        }

        let reason = if is_error(&frame) {
            "broker returned an error frame"
        } else {
            "unexpected frame from broker"
        };
        Err(NsqError::protocol_frame(reason, &frame))
    }

    fn handle_message(&mut self, token: Token, frame: &Frame) -> Result<(), NsqError> {
        let message = Message::from_frame(frame).expect("caller already checked this is a Message frame");

        let (topic, channel, callback) = {
            let sub = self
                .subscriptions
                .get(&token)
                .ok_or_else(|| NsqError::protocol("message on a connection with no subscription"))?;
            (sub.topic.clone(), sub.channel.clone(), sub.callback.clone())
        };

        if let Some(dedupe) = &self.dedupe {
            if dedupe.contains_and_add(&topic, &channel, &message) {
                debug!("deduplicating message {}", message.id());
                return self.finish(token, &message);
            }
        }

        let outcome = (callback.borrow_mut())(&message);

        match outcome {
            CallbackOutcome::Ack => self.finish(token, &message),
            CallbackOutcome::Expired => {
                info!("message {} expired", message.id());
                self.finish(token, &message)
            }
            CallbackOutcome::Requeue(delay) => {
                self.erase_dedupe(&topic, &channel, &message);
                self.requeue(token, &message, delay)
            }
            CallbackOutcome::Fail(err) => {
                warn!("callback failed for message {}: {}", message.id(), err);
                self.erase_dedupe(&topic, &channel, &message);

                let delay = self
                    .requeue_strategy
                    .as_ref()
                    .and_then(|strategy| strategy.should_requeue(&message));

                match delay {
                    Some(delay) => self.requeue(token, &message, delay),
                    None => {
                        debug!("not requeuing message {}", message.id());
                        self.finish(token, &message)
                    }
                }
            }
        }
    }

    fn erase_dedupe(&self, topic: &str, channel: &str, message: &Message) {
        if let Some(dedupe) = &self.dedupe {
            dedupe.erase(topic, channel, message);
        }
    }

    fn finish(&mut self, token: Token, message: &Message) -> Result<(), NsqError> {
        let conn = self
            .pool
            .find_by_token(token)
            .ok_or_else(|| NsqError::protocol("FIN on an unknown connection"))?;
        conn.write(&frame::encode_fin(&message.id()))?;
        conn.write(&frame::encode_rdy(1))
    }

    fn requeue(&mut self, token: Token, message: &Message, delay_ms: u64) -> Result<(), NsqError> {
        let conn = self
            .pool
            .find_by_token(token)
            .ok_or_else(|| NsqError::protocol("REQ on an unknown connection"))?;
        conn.write(&frame::encode_req(&message.id(), delay_ms))?;
        conn.write(&frame::encode_rdy(1))
    }

    fn drop_subscription(&mut self, event_loop: &mut EventLoop<Dispatcher>, token: Token, reason: &NsqError) {
        warn!("dropping subscription on {:?}: {}", token, reason);
        self.subscriptions.remove(&token);

        if let Some(conn) = self.pool.find_by_token(token) {
            if let Ok(stream) = conn.mio_stream() {
                let _ = event_loop.deregister(stream);
            }
        }

        self.pool.remove_by_token(token);
    }
}

fn validate_name(kind: &str, value: &str) -> Result<(), NsqError> {
    let len_ok = (2..=32).contains(&value.len());
    let chars_ok = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if len_ok && chars_ok {
        Ok(())
    } else {
        Err(NsqError::configuration(format!(
            "{} '{}' does not match {}",
            kind, value, TOPIC_CHANNEL_PATTERN_DESC
        )))
    }
}

fn register_for_read(event_loop: &mut EventLoop<Dispatcher>, conn: &Connection, token: Token) -> Result<(), NsqError> {
    let interest = EventSet::readable() | EventSet::error() | EventSet::hup();
    let opt = PollOpt::edge() | PollOpt::oneshot();

    event_loop
        .register(conn.mio_stream()?, token, interest, opt)
        .map_err(|e| NsqError::socket(conn.address(), e.to_string()))
}

fn reregister_for_read(event_loop: &mut EventLoop<Dispatcher>, conn: &Connection, token: Token) -> Result<(), NsqError> {
    let interest = EventSet::readable() | EventSet::error() | EventSet::hup();
    let opt = PollOpt::edge() | PollOpt::oneshot();

    event_loop
        .reregister(conn.mio_stream()?, token, interest, opt)
        .map_err(|e| NsqError::socket(conn.address(), e.to_string()))
}

impl Handler for Dispatcher {
    type Timeout = ();
    type Message = ControlSignal;

    fn ready(&mut self, event_loop: &mut EventLoop<Self>, token: Token, events: EventSet) {
        if events.is_error() || events.is_hup() {
            let reason = NsqError::socket("", "connection closed or errored");
            self.drop_subscription(event_loop, token, &reason);
            return;
        }

        if events.is_readable() {
            if let Err(err) = self.dispatch_one(token) {
                warn!("fatal protocol error on {:?}: {}", token, err);
                self.fatal_error = Some(err);
                event_loop.shutdown();
                return;
            }
        }

        if let Some(conn) = self.pool.find_by_token(token) {
            if let Err(err) = reregister_for_read(event_loop, conn, token) {
                warn!("failed to re-arm {:?} for read: {}", token, err);
            }
        }
    }

    fn notify(&mut self, event_loop: &mut EventLoop<Self>, msg: ControlSignal) {
        match msg {
            ControlSignal::Stop => event_loop.shutdown(),
        }
    }

    fn timeout(&mut self, event_loop: &mut EventLoop<Self>, _timeout: ()) {
        event_loop.shutdown();
    }
}
