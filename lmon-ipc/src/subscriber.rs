//! Subscribing side of the framed transport.
//!
//! A background thread owns the SUB socket and performs bounded-timeout
//! receives so it can observe the stop flag without blocking indefinitely.
//! The installed handler runs synchronously on that thread and must not
//! block. Multi-part violations drop the message silently and the loop
//! continues.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::codec::parse_header_map;
use crate::{BusError, SYSTEM_ID_KEY};

const SETTLE_DELAY: Duration = Duration::from_millis(100);
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked for every accepted message, on the subscriber thread.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8], &BTreeMap<String, String>) + Send + Sync>;

struct Shared {
    stop: AtomicBool,
    running: AtomicBool,
    filters: Mutex<Vec<String>>,
    filters_dirty: AtomicBool,
}

/// Single-process subscriber with topic filters and self-suppression.
pub struct Subscriber {
    endpoint: String,
    high_water_mark: i32,
    receive_timeout_ms: i32,
    exclude_system_id: Option<String>,
    handler: Option<MessageHandler>,
    shared: Arc<Shared>,
    context: Option<zmq::Context>,
    thread: Option<JoinHandle<()>>,
}

impl Subscriber {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            high_water_mark: 1000,
            receive_timeout_ms: 100,
            exclude_system_id: None,
            handler: None,
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                filters: Mutex::new(Vec::new()),
                filters_dirty: AtomicBool::new(false),
            }),
            context: None,
            thread: None,
        }
    }

    pub fn set_high_water_mark(&mut self, hwm: i32) {
        self.high_water_mark = hwm;
    }

    pub fn set_receive_timeout(&mut self, timeout_ms: i32) {
        self.receive_timeout_ms = timeout_ms;
    }

    /// Messages whose `System_ID` header equals this id are dropped before
    /// the handler runs.
    pub fn set_system_id_to_exclude(&mut self, system_id: impl Into<String>) {
        self.exclude_system_id = Some(system_id.into());
    }

    /// Install the message handler. Must be called before `start`.
    pub fn set_message_handler(&mut self, handler: MessageHandler) {
        self.handler = Some(handler);
    }

    /// Record a topic filter. Applied to the live socket on its next loop
    /// iteration when already running.
    pub fn subscribe(&self, topic_filter: impl Into<String>) {
        if let Ok(mut filters) = self.shared.filters.lock() {
            filters.push(topic_filter.into());
        }
        self.shared.filters_dirty.store(true, Ordering::SeqCst);
    }

    /// Remove a recorded filter and its socket-level subscription.
    pub fn unsubscribe(&self, topic_filter: &str) {
        if let Ok(mut filters) = self.shared.filters.lock() {
            filters.retain(|f| f != topic_filter);
        }
        self.shared.filters_dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Connect and launch the receive loop. Connection failures are fatal.
    pub fn start(&mut self) -> Result<(), BusError> {
        if self.is_running() {
            return Ok(());
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        let context = zmq::Context::new();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        let thread_context = context.clone();
        let endpoint = self.endpoint.clone();
        let hwm = self.high_water_mark;
        let timeout_ms = self.receive_timeout_ms;
        let exclude = self.exclude_system_id.clone();
        let handler = self.handler.clone();
        let shared = Arc::clone(&self.shared);

        let handle = thread::Builder::new()
            .name("lmon-subscriber".into())
            .spawn(move || {
                receive_loop(
                    thread_context,
                    endpoint,
                    hwm,
                    timeout_ms,
                    exclude,
                    handler,
                    shared,
                    ready_tx,
                )
            })
            .map_err(|e| BusError::Transport(format!("failed to spawn subscriber thread: {e}")))?;

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                let _ = handle.join();
                return Err(BusError::Transport(message));
            }
            Err(_) => {
                self.shared.stop.store(true, Ordering::SeqCst);
                let _ = handle.join();
                return Err(BusError::Transport("subscriber start timed out".into()));
            }
        }

        thread::sleep(SETTLE_DELAY);

        self.context = Some(context);
        self.thread = Some(handle);
        self.shared.running.store(true, Ordering::SeqCst);
        info!("subscriber started, connected to {}", self.endpoint);
        Ok(())
    }

    /// Flip the stop flag, let the bounded receive observe it, join the
    /// thread, then drop the context after the socket died with the thread.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }

        self.shared.stop.store(true, Ordering::SeqCst);

        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("subscriber thread panicked during shutdown");
            }
        }

        self.context = None;
        self.shared.running.store(false, Ordering::SeqCst);
        info!("subscriber stopped");
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn receive_loop(
    context: zmq::Context,
    endpoint: String,
    hwm: i32,
    timeout_ms: i32,
    exclude_system_id: Option<String>,
    handler: Option<MessageHandler>,
    shared: Arc<Shared>,
    ready_tx: mpsc::Sender<Result<(), String>>,
) {
    let socket = match setup_socket(&context, &endpoint, hwm, timeout_ms) {
        Ok(socket) => {
            let _ = ready_tx.send(Ok(()));
            socket
        }
        Err(message) => {
            let _ = ready_tx.send(Err(message));
            return;
        }
    };

    let mut applied = apply_filters(&socket, &shared, &[]);
    thread::sleep(SETTLE_DELAY);
    debug!("subscriber listening on {endpoint}");

    while !shared.stop.load(Ordering::SeqCst) {
        if shared.filters_dirty.swap(false, Ordering::SeqCst) {
            applied = apply_filters(&socket, &shared, &applied);
        }

        let topic = match socket.recv_bytes(0) {
            Ok(bytes) => bytes,
            Err(zmq::Error::EAGAIN) => continue,
            Err(e) => {
                warn!("error receiving topic frame: {e}");
                continue;
            }
        };

        // The header and payload frames must follow in the same message.
        if !has_more(&socket) {
            continue;
        }
        let Ok(header_bytes) = socket.recv_bytes(0) else {
            continue;
        };
        if !has_more(&socket) {
            continue;
        }
        let Ok(payload) = socket.recv_bytes(0) else {
            continue;
        };

        let topic = String::from_utf8_lossy(&topic).into_owned();
        let headers = parse_header_map(&String::from_utf8_lossy(&header_bytes));

        if let (Some(own_id), Some(sender)) = (&exclude_system_id, headers.get(SYSTEM_ID_KEY)) {
            if sender == own_id {
                trace!("ignoring own message on {topic}");
                continue;
            }
        }

        if let Some(handler) = &handler {
            handler(&topic, &payload, &headers);
        }
    }
    // Socket drops here, before the caller releases the context.
}

fn setup_socket(
    context: &zmq::Context,
    endpoint: &str,
    hwm: i32,
    timeout_ms: i32,
) -> Result<zmq::Socket, String> {
    let socket = context
        .socket(zmq::SUB)
        .map_err(|e| format!("failed to create SUB socket: {e}"))?;
    socket
        .set_rcvhwm(hwm)
        .map_err(|e| format!("failed to set receive high-water mark: {e}"))?;
    socket
        .set_rcvtimeo(timeout_ms)
        .map_err(|e| format!("failed to set receive timeout: {e}"))?;
    socket
        .connect(endpoint)
        .map_err(|e| format!("failed to connect {endpoint}: {e}"))?;
    Ok(socket)
}

/// Replace the socket-level subscriptions with the recorded filter list.
/// No recorded filters means subscribe-to-everything.
fn apply_filters(socket: &zmq::Socket, shared: &Shared, previous: &[String]) -> Vec<String> {
    for old in previous {
        if let Err(e) = socket.set_unsubscribe(old.as_bytes()) {
            warn!("failed to remove subscription '{old}': {e}");
        }
    }

    let filters = shared
        .filters
        .lock()
        .map(|f| f.clone())
        .unwrap_or_default();

    if filters.is_empty() {
        if let Err(e) = socket.set_subscribe(b"") {
            warn!("failed to subscribe to all topics: {e}");
        }
        return vec![String::new()];
    }

    for filter in &filters {
        if let Err(e) = socket.set_subscribe(filter.as_bytes()) {
            warn!("failed to subscribe to '{filter}': {e}");
        }
    }
    filters
}

fn has_more(socket: &zmq::Socket) -> bool {
    socket.get_rcvmore().unwrap_or(false)
}
