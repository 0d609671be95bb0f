//! Owned IPC bus instance.
//!
//! One `IpcBus` per process, created at the entry point and passed by
//! reference; initialization and shutdown are explicit. The statics of an
//! earlier design survive only as the default endpoint and topic constants
//! in the crate root.

use std::sync::Arc;
use std::sync::mpsc::Sender;

use log::{debug, info};
use lmon_utils::IpcSettings;

use crate::codec::serialize_message;
use crate::dispatcher::{BusEvent, Dispatcher, SystemMode};
use crate::message::IpcMessage;
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;
use crate::{BusError, DEFAULT_PUBLISHER_ENDPOINT, DEFAULT_SUBSCRIBER_ENDPOINT, TOPIC_PREFIX};

/// Bus construction parameters.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Endpoint subscribers connect to; the publisher bind endpoint is
    /// derived from its port suffix.
    pub subscriber_endpoint: String,
    pub high_water_mark: i32,
    pub linger_ms: i32,
    pub receive_timeout_ms: i32,
    /// Fixed system id; generated from host name and pid when `None`.
    pub system_id: Option<String>,
    pub mode: SystemMode,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_endpoint: DEFAULT_SUBSCRIBER_ENDPOINT.to_string(),
            high_water_mark: 1000,
            linger_ms: 1000,
            receive_timeout_ms: 100,
            system_id: None,
            mode: SystemMode::Camera1,
        }
    }
}

impl BusConfig {
    /// Build a bus configuration from persisted IPC settings.
    pub fn from_settings(settings: &IpcSettings, mode: SystemMode) -> Self {
        Self {
            subscriber_endpoint: settings.endpoint.clone(),
            high_water_mark: settings.high_water_mark,
            linger_ms: settings.linger_ms,
            receive_timeout_ms: settings.receive_timeout_ms,
            system_id: settings.system_id.clone(),
            mode,
        }
    }
}

/// The process's connection to the message plane.
pub struct IpcBus {
    system_id: String,
    mode: SystemMode,
    publisher: Publisher,
    subscriber: Subscriber,
    dispatcher: Option<Arc<Dispatcher>>,
    running: bool,
}

impl IpcBus {
    pub fn new(config: BusConfig) -> Self {
        let system_id = config
            .system_id
            .clone()
            .unwrap_or_else(default_system_id);

        let publisher_endpoint = derive_publisher_endpoint(&config.subscriber_endpoint);
        debug!(
            "bus endpoints: publish {} / subscribe {}",
            publisher_endpoint, config.subscriber_endpoint
        );

        let mut publisher = Publisher::new(publisher_endpoint);
        publisher.set_high_water_mark(config.high_water_mark);
        publisher.set_linger(config.linger_ms);

        let mut subscriber = Subscriber::new(config.subscriber_endpoint.clone());
        subscriber.set_high_water_mark(config.high_water_mark);
        subscriber.set_receive_timeout(config.receive_timeout_ms);
        subscriber.set_system_id_to_exclude(system_id.clone());

        Self {
            system_id,
            mode: config.mode,
            publisher,
            subscriber,
            dispatcher: None,
            running: false,
        }
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn is_running(&self) -> bool {
        self.running && self.publisher.is_running() && self.subscriber.is_running()
    }

    /// Access the dispatcher for its counters and stashed images.
    pub fn dispatcher(&self) -> Option<&Arc<Dispatcher>> {
        self.dispatcher.as_ref()
    }

    /// Start publisher and subscriber and wire inbound traffic to `events`.
    pub fn start(&mut self, events: Sender<BusEvent>) -> Result<(), BusError> {
        if self.running {
            return Ok(());
        }

        info!(
            "starting IPC bus (system id {}, mode {:?})",
            self.system_id, self.mode
        );

        let dispatcher = Arc::new(Dispatcher::new(
            self.system_id.clone(),
            self.mode,
            events,
        ));

        self.publisher.start()?;

        let handler_dispatcher = Arc::clone(&dispatcher);
        self.subscriber.set_message_handler(Arc::new(
            move |topic: &str, payload: &[u8], headers| {
                handler_dispatcher.on_message(topic, payload, headers);
            },
        ));
        self.subscriber.subscribe(TOPIC_PREFIX);

        if let Err(e) = self.subscriber.start() {
            self.publisher.stop();
            return Err(e);
        }

        self.dispatcher = Some(dispatcher);
        self.running = true;
        info!("IPC bus started");
        Ok(())
    }

    /// Serialize and enqueue one message.
    pub fn send(&self, message: &IpcMessage) -> Result<(), BusError> {
        if !self.running {
            return Err(BusError::NotRunning);
        }

        let (topic, headers, payload) = serialize_message(message, &self.system_id)?;
        self.publisher.send(&topic, &headers, payload)
    }

    /// Stop subscriber first (no more inbound dispatch), then publisher.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.subscriber.stop();
        self.publisher.stop();
        self.running = false;
        info!("IPC bus stopped");
    }
}

impl Drop for IpcBus {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Derive the publisher bind endpoint from a subscriber endpoint's port
/// suffix, e.g. `tcp://localhost:5561` binds `tcp://*:5561`.
fn derive_publisher_endpoint(subscriber_endpoint: &str) -> String {
    match subscriber_endpoint.rfind(':') {
        Some(pos) if pos + 1 < subscriber_endpoint.len() => {
            format!("tcp://*:{}", &subscriber_endpoint[pos + 1..])
        }
        _ => DEFAULT_PUBLISHER_ENDPOINT.to_string(),
    }
}

fn default_system_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "lmon".to_string());
    format!("{host}_{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_endpoint_derives_from_port_suffix() {
        assert_eq!(
            derive_publisher_endpoint("tcp://localhost:5556"),
            "tcp://*:5556"
        );
        assert_eq!(
            derive_publisher_endpoint("tcp://10.0.0.7:7001"),
            "tcp://*:7001"
        );
        assert_eq!(derive_publisher_endpoint("garbage"), DEFAULT_PUBLISHER_ENDPOINT);
    }

    #[test]
    fn generated_system_ids_are_distinct_per_process() {
        let id = default_system_id();
        assert!(id.contains('_'));
        assert!(!id.is_empty());
    }

    #[test]
    fn send_before_start_reports_not_running() {
        let bus = IpcBus::new(BusConfig::default());
        let err = bus.send(&IpcMessage::Shutdown).unwrap_err();
        assert!(matches!(err, BusError::NotRunning));
    }
}
