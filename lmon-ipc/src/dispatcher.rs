//! Routing of inbound bus messages onto the host event queue.
//!
//! The mapping from (system mode, message type) to emitted event is fixed
//! and exhaustive. Payloads that cannot be rebuilt into a typed message are
//! dropped and counted so malformed traffic stays observable.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;

use log::{debug, trace, warn};
use lmon_utils::BgrFrame;

use crate::codec::decode_message;
use crate::message::{ControlCode, IpcMessage, MessageType};
use crate::{MESSAGE_TYPE_KEY, SYSTEM_ID_KEY};

/// Role of this process on the bus, established at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMode {
    Camera1,
    Camera1Standalone,
    Camera2,
    Camera2Standalone,
    Camera1AutoCalibrate,
    Camera2AutoCalibrate,
    Camera1BallLocation,
    Camera2BallLocation,
    /// Camera-2 capture process whose frames are analyzed on the pi-1 host.
    Cam2ProcessForPi1,
    Test,
}

impl SystemMode {
    fn is_camera1_role(self) -> bool {
        matches!(self, Self::Camera1 | Self::Camera1Standalone)
    }

    fn is_camera2_role(self) -> bool {
        matches!(self, Self::Camera2 | Self::Camera2Standalone)
    }

    fn captures_received_images(self) -> bool {
        matches!(
            self,
            Self::Camera1AutoCalibrate
                | Self::Camera2AutoCalibrate
                | Self::Camera1BallLocation
                | Self::Camera2BallLocation
        )
    }
}

/// Events emitted onto the host application's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A full-resolution image arrived from camera 2.
    Camera2ImageReceived(BgrFrame),
    /// A pre-shot image arrived from camera 2.
    Camera2PreImageReceived(BgrFrame),
    /// This process should arm its camera-2 capture.
    ArmCamera2,
    /// A control instruction arrived.
    Control(ControlCode),
    /// The process should exit.
    Exit,
}

/// Routes raw (topic, payload, headers) triples from the subscriber
/// callback to typed events.
pub struct Dispatcher {
    system_id: String,
    mode: SystemMode,
    events: Sender<BusEvent>,
    malformed_messages: AtomicU64,
    last_received_image: Mutex<Option<BgrFrame>>,
}

impl Dispatcher {
    pub fn new(system_id: impl Into<String>, mode: SystemMode, events: Sender<BusEvent>) -> Self {
        Self {
            system_id: system_id.into(),
            mode,
            events,
            malformed_messages: AtomicU64::new(0),
            last_received_image: Mutex::new(None),
        }
    }

    /// Number of inbound payloads that could not be rebuilt into a typed
    /// message.
    pub fn malformed_messages(&self) -> u64 {
        self.malformed_messages.load(Ordering::Relaxed)
    }

    /// Take the most recent image stashed by a calibrate or ball-location
    /// role.
    pub fn take_last_received_image(&self) -> Option<BgrFrame> {
        self.last_received_image
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }

    /// Handle one raw message from the subscriber. Returns whether the
    /// message was accepted (dropped-by-design counts as accepted).
    pub fn on_message(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> bool {
        trace!("message received on topic {topic}");

        if headers.get(SYSTEM_ID_KEY) == Some(&self.system_id) {
            trace!("ignoring own message");
            return true;
        }

        let message_type = headers
            .get(MESSAGE_TYPE_KEY)
            .and_then(|raw| raw.parse::<i32>().ok())
            .map(MessageType::from_wire)
            .unwrap_or(MessageType::Unknown);

        if message_type == MessageType::Unknown {
            self.malformed_messages.fetch_add(1, Ordering::Relaxed);
            warn!("message on {topic} carries no usable {MESSAGE_TYPE_KEY} header");
            return false;
        }

        let message = match decode_message(message_type, payload) {
            Ok(message) => message,
            Err(e) => {
                self.malformed_messages.fetch_add(1, Ordering::Relaxed);
                warn!("unable to rebuild {message_type} message: {e}");
                return false;
            }
        };

        self.dispatch(message)
    }

    /// Route one decoded message. The message is owned here and dropped on
    /// every path.
    pub fn dispatch(&self, message: IpcMessage) -> bool {
        match message {
            IpcMessage::CameraImage(frame) => self.dispatch_camera_image(frame),
            IpcMessage::CameraPreImage(frame) => self.dispatch_pre_image(frame),
            IpcMessage::Shutdown => self.emit(BusEvent::Exit),
            IpcMessage::RequestForCameraImage => self.dispatch_image_request(),
            IpcMessage::Control(code) => self.emit(BusEvent::Control(code)),
            IpcMessage::Results(values) => {
                debug!("results message received ({} entries)", values.len());
                true
            }
            IpcMessage::Unknown => {
                warn!("received message of unknown type");
                false
            }
        }
    }

    fn dispatch_camera_image(&self, frame: BgrFrame) -> bool {
        if self.mode.captures_received_images() {
            trace!("calibrate/locate mode; stashing received image");
            if let Ok(mut slot) = self.last_received_image.lock() {
                *slot = Some(frame);
            }
            return true;
        }

        if self.mode.is_camera2_role() {
            return true;
        }
        if self.mode.is_camera1_role() {
            return self.emit(BusEvent::Camera2ImageReceived(frame));
        }

        warn!("camera image received in unsupported mode {:?}", self.mode);
        false
    }

    fn dispatch_pre_image(&self, frame: BgrFrame) -> bool {
        if self.mode.is_camera2_role() {
            return true;
        }
        if self.mode.is_camera1_role() {
            return self.emit(BusEvent::Camera2PreImageReceived(frame));
        }

        warn!("pre-image received in unsupported mode {:?}", self.mode);
        false
    }

    fn dispatch_image_request(&self) -> bool {
        match self.mode {
            SystemMode::Camera2 | SystemMode::Camera2Standalone | SystemMode::Cam2ProcessForPi1 => {
                self.emit(BusEvent::ArmCamera2)
            }
            SystemMode::Camera1
            | SystemMode::Camera1Standalone
            | SystemMode::Camera1AutoCalibrate
            | SystemMode::Camera2AutoCalibrate => true,
            _ => {
                warn!("image request received in unsupported mode {:?}", self.mode);
                false
            }
        }
    }

    fn emit(&self, event: BusEvent) -> bool {
        if self.events.send(event).is_err() {
            warn!("host event queue is gone; dropping event");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::serialize_message;
    use std::sync::mpsc;

    fn dispatcher(mode: SystemMode) -> (Dispatcher, mpsc::Receiver<BusEvent>) {
        let (tx, rx) = mpsc::channel();
        (Dispatcher::new("self_id", mode, tx), rx)
    }

    fn wire(message: &IpcMessage, sender: &str) -> (String, BTreeMap<String, String>, Vec<u8>) {
        serialize_message(message, sender).expect("serialize")
    }

    #[test]
    fn own_messages_are_dropped_silently() {
        let (dispatcher, rx) = dispatcher(SystemMode::Camera1);
        let (topic, headers, payload) = wire(&IpcMessage::Shutdown, "self_id");

        assert!(dispatcher.on_message(&topic, &payload, &headers));
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.malformed_messages(), 0);
    }

    #[test]
    fn shutdown_emits_exit_in_every_mode() {
        for mode in [
            SystemMode::Camera1,
            SystemMode::Camera2,
            SystemMode::Test,
            SystemMode::Cam2ProcessForPi1,
        ] {
            let (dispatcher, rx) = dispatcher(mode);
            let (topic, headers, payload) = wire(&IpcMessage::Shutdown, "peer");
            assert!(dispatcher.on_message(&topic, &payload, &headers));
            assert_eq!(rx.try_recv().unwrap(), BusEvent::Exit);
        }
    }

    #[test]
    fn camera_image_routes_by_mode() {
        let frame = BgrFrame::zeros(2, 2);

        let (dispatcher1, rx) = dispatcher(SystemMode::Camera1);
        assert!(dispatcher1.dispatch(IpcMessage::CameraImage(frame.clone())));
        assert!(matches!(
            rx.try_recv().unwrap(),
            BusEvent::Camera2ImageReceived(_)
        ));

        let (dispatcher2, rx) = dispatcher(SystemMode::Camera2);
        assert!(dispatcher2.dispatch(IpcMessage::CameraImage(frame.clone())));
        assert!(rx.try_recv().is_err());

        let (dispatcher3, rx) = dispatcher(SystemMode::Camera1AutoCalibrate);
        assert!(dispatcher3.dispatch(IpcMessage::CameraImage(frame.clone())));
        assert!(rx.try_recv().is_err());
        assert!(dispatcher3.take_last_received_image().is_some());
        assert!(dispatcher3.take_last_received_image().is_none());

        let (dispatcher4, rx) = dispatcher(SystemMode::Test);
        assert!(!dispatcher4.dispatch(IpcMessage::CameraImage(frame)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn image_request_arms_camera2_roles_only() {
        for mode in [
            SystemMode::Camera2,
            SystemMode::Camera2Standalone,
            SystemMode::Cam2ProcessForPi1,
        ] {
            let (dispatcher, rx) = dispatcher(mode);
            assert!(dispatcher.dispatch(IpcMessage::RequestForCameraImage));
            assert_eq!(rx.try_recv().unwrap(), BusEvent::ArmCamera2);
        }

        for mode in [SystemMode::Camera1, SystemMode::Camera1AutoCalibrate] {
            let (dispatcher, rx) = dispatcher(mode);
            assert!(dispatcher.dispatch(IpcMessage::RequestForCameraImage));
            assert!(rx.try_recv().is_err());
        }

        let (dispatcher, rx) = dispatcher(SystemMode::Camera1BallLocation);
        assert!(!dispatcher.dispatch(IpcMessage::RequestForCameraImage));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn control_messages_carry_their_code() {
        let (dispatcher, rx) = dispatcher(SystemMode::Camera1);
        let (topic, headers, payload) =
            wire(&IpcMessage::Control(ControlCode::ClubChangeToDriver), "peer");
        assert!(dispatcher.on_message(&topic, &payload, &headers));
        assert_eq!(
            rx.try_recv().unwrap(),
            BusEvent::Control(ControlCode::ClubChangeToDriver)
        );
    }

    #[test]
    fn malformed_payloads_are_counted_not_fatal() {
        let (dispatcher, rx) = dispatcher(SystemMode::Camera1);

        let mut headers = BTreeMap::new();
        headers.insert(SYSTEM_ID_KEY.to_string(), "peer".to_string());
        headers.insert(MESSAGE_TYPE_KEY.to_string(), "2".to_string());
        assert!(!dispatcher.on_message("Golf.Sim.Message", b"junk", &headers));
        assert_eq!(dispatcher.malformed_messages(), 1);

        // Missing type header counts too.
        let mut headers = BTreeMap::new();
        headers.insert(SYSTEM_ID_KEY.to_string(), "peer".to_string());
        assert!(!dispatcher.on_message("Golf.Sim.Message", b"junk", &headers));
        assert_eq!(dispatcher.malformed_messages(), 2);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn results_messages_are_consumed_by_logging_only() {
        let (dispatcher, rx) = dispatcher(SystemMode::Camera1);
        let mut values = BTreeMap::new();
        values.insert("carry_m".to_string(), "182.0".to_string());
        assert!(dispatcher.dispatch(IpcMessage::Results(values)));
        assert!(rx.try_recv().is_err());
    }
}
