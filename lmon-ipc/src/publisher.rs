//! Publishing side of the framed transport.
//!
//! The public `send` never touches the socket: it enqueues and notifies a
//! background thread that owns the PUB socket for its whole lifetime. Each
//! application message goes out as exactly three frames: topic bytes,
//! header object text, body payload.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::BusError;
use crate::codec::encode_header_map;

/// How long the sender thread sleeps waiting for work before re-checking
/// the stop flag, and how long bind waits for subscriptions to propagate.
const QUEUE_POLL: Duration = Duration::from_millis(100);
const SETTLE_DELAY: Duration = Duration::from_millis(100);
const START_TIMEOUT: Duration = Duration::from_secs(5);

struct Outbound {
    topic: String,
    headers: String,
    payload: Vec<u8>,
}

struct Shared {
    queue: Mutex<VecDeque<Outbound>>,
    available: Condvar,
    stop: AtomicBool,
    running: AtomicBool,
}

/// Single-process publisher with an internal FIFO send queue.
pub struct Publisher {
    endpoint: String,
    high_water_mark: i32,
    linger_ms: i32,
    shared: Arc<Shared>,
    context: Option<zmq::Context>,
    thread: Option<JoinHandle<()>>,
}

impl Publisher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            high_water_mark: 1000,
            linger_ms: 1000,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            context: None,
            thread: None,
        }
    }

    pub fn set_high_water_mark(&mut self, hwm: i32) {
        self.high_water_mark = hwm;
    }

    pub fn set_linger(&mut self, linger_ms: i32) {
        self.linger_ms = linger_ms;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Bind the socket and launch the sender thread. Bind failures are
    /// fatal and reported here, not swallowed inside the thread.
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
        let linger = self.linger_ms;
        let shared = Arc::clone(&self.shared);

        let handle = thread::Builder::new()
            .name("lmon-publisher".into())
            .spawn(move || sender_loop(thread_context, endpoint, hwm, linger, shared, ready_tx))
            .map_err(|e| BusError::Transport(format!("failed to spawn publisher thread: {e}")))?;

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                let _ = handle.join();
                return Err(BusError::Transport(message));
            }
            Err(_) => {
                self.shared.stop.store(true, Ordering::SeqCst);
                self.shared.available.notify_all();
                let _ = handle.join();
                return Err(BusError::Transport("publisher start timed out".into()));
            }
        }

        // Give late subscribers a chance to see the endpoint before the
        // first message goes out.
        thread::sleep(SETTLE_DELAY);

        self.context = Some(context);
        self.thread = Some(handle);
        self.shared.running.store(true, Ordering::SeqCst);
        info!("publisher started on {}", self.endpoint);
        Ok(())
    }

    /// Enqueue one message for delivery. Non-blocking; ordering across
    /// calls from one thread is preserved by the FIFO queue.
    pub fn send(
        &self,
        topic: &str,
        headers: &BTreeMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        if !self.is_running() {
            return Err(BusError::NotRunning);
        }

        let message = Outbound {
            topic: topic.to_string(),
            headers: encode_header_map(headers),
            payload,
        };

        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .map_err(|_| BusError::Transport("send queue poisoned".into()))?;
            queue.push_back(message);
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Flip the stop flag, wake the thread, join it, then drop the socket
    /// (inside the thread) and the context (here), in that order.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }

        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();

        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("publisher thread panicked during shutdown");
            }
        }

        self.context = None;
        self.shared.running.store(false, Ordering::SeqCst);
        info!("publisher stopped");
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sender_loop(
    context: zmq::Context,
    endpoint: String,
    hwm: i32,
    linger: i32,
    shared: Arc<Shared>,
    ready_tx: mpsc::Sender<Result<(), String>>,
) {
    let socket = match setup_socket(&context, &endpoint, hwm, linger) {
        Ok(socket) => {
            let _ = ready_tx.send(Ok(()));
            socket
        }
        Err(message) => {
            let _ = ready_tx.send(Err(message));
            return;
        }
    };

    thread::sleep(SETTLE_DELAY);

    'outer: loop {
        let mut queue = match shared.queue.lock() {
            Ok(queue) => queue,
            Err(_) => break,
        };
        while queue.is_empty() && !shared.stop.load(Ordering::SeqCst) {
            let (guard, _) = match shared.available.wait_timeout(queue, QUEUE_POLL) {
                Ok(result) => result,
                Err(_) => break 'outer,
            };
            queue = guard;
        }
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        while let Some(message) = queue.pop_front() {
            drop(queue);
            if let Err(e) = send_frames(&socket, &message) {
                warn!("error sending message on {}: {e}", message.topic);
            }
            if shared.stop.load(Ordering::SeqCst) {
                break 'outer;
            }
            queue = match shared.queue.lock() {
                Ok(queue) => queue,
                Err(_) => break 'outer,
            };
        }
    }
    // Socket drops here, before the caller releases the context.
}

fn setup_socket(
    context: &zmq::Context,
    endpoint: &str,
    hwm: i32,
    linger: i32,
) -> Result<zmq::Socket, String> {
    let socket = context
        .socket(zmq::PUB)
        .map_err(|e| format!("failed to create PUB socket: {e}"))?;
    socket
        .set_sndhwm(hwm)
        .map_err(|e| format!("failed to set send high-water mark: {e}"))?;
    socket
        .set_linger(linger)
        .map_err(|e| format!("failed to set linger: {e}"))?;
    socket
        .bind(endpoint)
        .map_err(|e| format!("failed to bind {endpoint}: {e}"))?;
    Ok(socket)
}

fn send_frames(socket: &zmq::Socket, message: &Outbound) -> Result<(), zmq::Error> {
    socket.send(message.topic.as_bytes(), zmq::SNDMORE)?;
    socket.send(message.headers.as_bytes(), zmq::SNDMORE)?;
    socket.send(message.payload.as_slice(), 0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_before_start_reports_not_running() {
        let publisher = Publisher::new("tcp://*:5599");
        let err = publisher
            .send("Golf.Sim.Message", &BTreeMap::new(), vec![1, 2, 3])
            .unwrap_err();
        assert!(matches!(err, BusError::NotRunning));
    }

    #[test]
    fn bind_failure_is_fatal_at_start() {
        let mut publisher = Publisher::new("tcp://256.0.0.1:bogus");
        let err = publisher.start().unwrap_err();
        assert!(matches!(err, BusError::Transport(_)));
        assert!(!publisher.is_running());
    }
}
