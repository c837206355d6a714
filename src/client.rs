use std::sync::Arc;
use std::time::Duration;

use log::info;
use mio::deprecated::{EventLoop, Sender};
use serde_json::Value;

use crate::error::{CallbackOutcome, NsqError};
use crate::frame;
use crate::global::ToMillis;
use crate::message::Message;
use crate::publisher::{ConsistencyLevel, IntoHosts, Publisher};
use crate::subscriber::{ControlSignal, Dispatcher};
use crate::traits::{DedupeService, LookupService, Logger, RequeueStrategy};

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 3;
const DEFAULT_READ_WRITE_TIMEOUT_SECS: u64 = 3;
const DEFAULT_READ_WAIT_TIMEOUT_SECS: u64 = 15;

/// Constructor-level options, collected once at [`Client::new`] time and
/// immutable afterwards.
pub struct ClientConfig {
    pub connection_timeout: Duration,
    pub read_write_timeout: Duration,
    pub read_wait_timeout: Duration,
    pub lookup: Option<Arc<dyn LookupService + Send + Sync>>,
    pub dedupe: Option<Arc<dyn DedupeService + Send + Sync>>,
    pub requeue_strategy: Option<Arc<dyn RequeueStrategy + Send + Sync>>,
    pub logger: Option<Arc<dyn Logger + Send + Sync>>,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connection_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_write_timeout: Duration::from_secs(DEFAULT_READ_WRITE_TIMEOUT_SECS),
            read_wait_timeout: Duration::from_secs(DEFAULT_READ_WAIT_TIMEOUT_SECS),
            lookup: None,
            dedupe: None,
            requeue_strategy: None,
            logger: None,
        }
    }
}

#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn read_write_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_write_timeout = timeout;
        self
    }

    pub fn read_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_wait_timeout = timeout;
        self
    }

    pub fn lookup(mut self, lookup: Arc<dyn LookupService + Send + Sync>) -> Self {
        self.config.lookup = Some(lookup);
        self
    }

    pub fn dedupe(mut self, dedupe: Arc<dyn DedupeService + Send + Sync>) -> Self {
        self.config.dedupe = Some(dedupe);
        self
    }

    pub fn requeue_strategy(mut self, strategy: Arc<dyn RequeueStrategy + Send + Sync>) -> Self {
        self.config.requeue_strategy = Some(strategy);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger + Send + Sync>) -> Self {
        self.config.logger = Some(logger);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// The public façade: wires the publisher, the subscribe dispatch loop and
/// its event loop together behind `publish_to`/`publish`/`subscribe`/`run`/`stop`.
pub struct Client {
    config: ClientConfig,
    publisher: Publisher,
    event_loop: EventLoop<Dispatcher>,
    dispatcher: Dispatcher,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Client, NsqError> {
        let event_loop = EventLoop::new().map_err(|e| NsqError::socket("", e.to_string()))?;
        let dispatcher = Dispatcher::new(config.dedupe.clone(), config.requeue_strategy.clone());
        let publisher = Publisher::new(config.connection_timeout, config.read_write_timeout, config.read_wait_timeout);

        Ok(Client {
            config,
            publisher,
            event_loop,
            dispatcher,
        })
    }

    /// A channel that can trigger `stop()` from any thread, including from
    /// inside a subscribe callback running on the loop thread.
    pub fn notifier(&self) -> ClientNotifier {
        ClientNotifier {
            sender: self.event_loop.channel(),
        }
    }

    pub fn publish_to(&mut self, hosts: impl IntoHosts, level: ConsistencyLevel) -> Result<(), NsqError> {
        self.publisher.publish_to(hosts, level)
    }

    pub fn publish(&self, topic: &str, body: &[u8]) -> Result<usize, NsqError> {
        self.publisher.publish(topic, body)
    }

    /// Discovers endpoints for `topic` via the configured `LookupService`,
    /// connects to every one of them, and registers them with the event
    /// loop. Call `run` afterwards to actually start dispatching.
    pub fn subscribe(
        &mut self,
        topic: &str,
        channel: &str,
        callback: impl FnMut(&Message) -> CallbackOutcome + 'static,
    ) -> Result<(), NsqError> {
        self.subscribe_with_params(topic, channel, None, callback)
    }

    pub fn subscribe_with_params(
        &mut self,
        topic: &str,
        channel: &str,
        params: Option<Value>,
        callback: impl FnMut(&Message) -> CallbackOutcome + 'static,
    ) -> Result<(), NsqError> {
        let lookup = self
            .config
            .lookup
            .as_ref()
            .ok_or_else(|| NsqError::configuration("subscribe requires a configured LookupService"))?;

        let hosts = lookup.lookup_hosts(topic)?;
        self.log_info(&format!("subscribing to {}/{} across {} node(s)", topic, channel, hosts.len()));

        self.dispatcher.subscribe(
            &mut self.event_loop,
            topic,
            channel,
            &hosts,
            params,
            callback,
            self.config.connection_timeout,
            self.config.read_write_timeout,
            self.config.read_wait_timeout,
        )
    }

    /// Drives the event loop. If `timeout` is `Some`, a one-shot timer
    /// stops the loop once it elapses; `None` runs until `stop()` is
    /// called. Returns the fatal protocol error, if any, that caused the
    /// loop to exit on its own.
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<(), NsqError> {
        self.log_info("entering dispatch loop");

        if let Some(timeout) = timeout {
            self.event_loop
                .timeout((), timeout)
                .map_err(|e| NsqError::configuration(format!("failed to arm run timeout: {:?}", e)))?;
        }

        self.event_loop
            .run(&mut self.dispatcher)
            .map_err(|e| NsqError::socket("", e.to_string()))?;

        match self.dispatcher.take_fatal_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Emits through the `log` facade unconditionally, and additionally
    /// through the configured `Logger` when the host asked for one.
    fn log_info(&self, message: &str) {
        info!("{}", message);
        if let Some(logger) = &self.config.logger {
            logger.info(message);
        }
    }

    pub fn stop(&self) {
        let _ = self.event_loop.channel().send(ControlSignal::Stop);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for conn in self.dispatcher.pool_mut().iter_mut() {
            let _ = conn.write(&frame::encode_cls());
        }
    }
}

/// A cloneable, `Send` handle that can stop a running [`Client`] from any
/// thread by posting onto the event loop's notification channel.
#[derive(Clone)]
pub struct ClientNotifier {
    sender: Sender<ControlSignal>,
}

impl ClientNotifier {
    pub fn stop(&self) -> Result<(), NsqError> {
        self.sender
            .send(ControlSignal::Stop)
            .map_err(|e| NsqError::configuration(format!("failed to post stop signal: {:?}", e)))
    }
}
