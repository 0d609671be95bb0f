//! Inter-process messaging for the launch monitor.
//!
//! A many-to-many publish/subscribe plane over ZeroMQ carries image frames,
//! control commands, shutdown signals, and result payloads between the two
//! camera processes and downstream consumers. Messages travel as three
//! frames: topic bytes, a flat JSON header object, and a binary body.

/// Owned bus instance wiring publisher, subscriber, and dispatcher.
pub mod bus;
/// Envelope header and typed-body wire codec.
pub mod codec;
/// Inbound message routing onto the host event queue.
pub mod dispatcher;
/// Message and control-code enumerations, tagged message union.
pub mod message;
/// Publishing side of the framed transport.
pub mod publisher;
/// Simulator JSON responder (handshake, ping, arm state, player data).
pub mod sim;
/// Subscribing side of the framed transport.
pub mod subscriber;

use thiserror::Error;

pub use bus::{BusConfig, IpcBus};
pub use dispatcher::{BusEvent, Dispatcher, SystemMode};
pub use message::{ControlCode, IpcMessage, MessageType};
pub use publisher::Publisher;
pub use sim::{SimResponder, SimResponderConfig};
pub use subscriber::{MessageHandler, Subscriber};

/// Failures surfaced by the messaging plane.
#[derive(Debug, Error)]
pub enum BusError {
    /// Message missing required headers or carrying an unusable body.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    /// Socket or serializer failure.
    #[error("transport fault: {0}")]
    Transport(String),
    /// The component is not running.
    #[error("not running")]
    NotRunning,
}

/// Topic prefix used as the coarse subscription.
pub const TOPIC_PREFIX: &str = "Golf.Sim";
/// Generic bus for image and control traffic.
pub const TOPIC_MESSAGE: &str = "Golf.Sim.Message";
/// Result payloads.
pub const TOPIC_RESULTS: &str = "Golf.Sim.Results";
/// Control-only traffic.
pub const TOPIC_CONTROL: &str = "Golf.Sim.Control";

/// Header key carrying the sender's system id.
pub const SYSTEM_ID_KEY: &str = "System_ID";
/// Header key carrying the stringified message-type integer.
pub const MESSAGE_TYPE_KEY: &str = "Message_Type";
/// Header key carrying milliseconds since the epoch.
pub const TIMESTAMP_KEY: &str = "Timestamp";

/// Default endpoint subscribers connect to.
pub const DEFAULT_SUBSCRIBER_ENDPOINT: &str = "tcp://localhost:5556";
/// Default endpoint the publisher binds.
pub const DEFAULT_PUBLISHER_ENDPOINT: &str = "tcp://*:5556";
