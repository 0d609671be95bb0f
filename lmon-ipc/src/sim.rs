//! Simulator protocol responder.
//!
//! The simulator talks small JSON objects tagged by `Type`. This responder
//! implements the reply side of that contract: the SHA-256 challenge
//! handshake, authentication acknowledgement, ping, arm state, and player
//! data changes. Parse failures are tolerated (the stream sometimes carries
//! trailing garbage) but counted so they stay observable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;

use log::{error, info, trace, warn};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::dispatcher::BusEvent;
use crate::message::ControlCode;

/// Identity used in challenge replies.
#[derive(Debug, Clone)]
pub struct SimResponderConfig {
    /// Developer id presented to the simulator.
    pub developer_id: String,
    /// Shared secret appended to the challenge before hashing.
    pub secret_key: String,
}

/// Stateful responder for one simulator connection.
pub struct SimResponder {
    config: SimResponderConfig,
    armed: AtomicBool,
    malformed_messages: AtomicU64,
    events: Sender<BusEvent>,
}

impl SimResponder {
    pub fn new(config: SimResponderConfig, events: Sender<BusEvent>) -> Self {
        Self {
            config,
            armed: AtomicBool::new(false),
            malformed_messages: AtomicU64::new(0),
            events,
        }
    }

    /// Whether the simulator has armed itself for the next shot.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Messages that failed to parse as JSON.
    pub fn malformed_messages(&self) -> u64 {
        self.malformed_messages.load(Ordering::Relaxed)
    }

    /// Process one inbound JSON message and produce the reply to write
    /// back, if any. Malformed input is swallowed without a reply.
    pub fn process_json(&self, text: &str) -> Option<String> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                self.malformed_messages.fetch_add(1, Ordering::Relaxed);
                error!("failed to parse simulator message: {e}");
                return None;
            }
        };

        let message_type = value.get("Type").and_then(Value::as_str).unwrap_or("");
        if message_type.is_empty() {
            warn!("simulator message carries no 'Type' tag");
            return None;
        }

        match message_type {
            // The documentation says a handshake precedes the challenge,
            // but real traffic carries the challenge data on the handshake
            // frame, so both take the challenge path.
            "Handshake" | "Challenge" => {
                trace!("received {message_type}");
                Some(self.challenge_reply(&value))
            }
            "Authentication" => {
                let success = value.get("Success").and_then(Value::as_str).unwrap_or("");
                if success == "true" {
                    info!("simulator authentication succeeded");
                } else {
                    warn!("simulator authentication returned success={success}");
                }
                None
            }
            "SimCommand" => self.process_sim_command(&value),
            "ACK" => {
                trace!("simulator ACK: {}", details_of(&value));
                None
            }
            "Warning" => {
                warn!("simulator warning: {}", details_of(&value));
                None
            }
            "ShotError" => {
                error!("simulator shot error: {}", details_of(&value));
                None
            }
            "ShotComplete" => None,
            other => {
                warn!("received unknown simulator 'Type' tag: {other}");
                None
            }
        }
    }

    fn process_sim_command(&self, value: &Value) -> Option<String> {
        let subtype = value.get("SubType").and_then(Value::as_str).unwrap_or("");
        match subtype {
            "Ping" => Some("{\"Type\":\"Pong\"}".to_string()),
            "Arm" => {
                self.armed.store(true, Ordering::SeqCst);
                None
            }
            "Disarm" => {
                self.armed.store(false, Ordering::SeqCst);
                None
            }
            "EnvironmentDataModified" => None,
            "PlayerDataModified" => {
                let details = value.get("Details");
                let club = details
                    .and_then(|d| d.get("ClubType"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let handedness = details
                    .and_then(|d| d.get("Handedness"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if details.is_none() {
                    warn!("PlayerDataModified carried no player information");
                }
                info!("player data: club={club}, handedness={handedness}");

                if !club.is_empty() {
                    let instruction = if club == "Putter" {
                        ControlCode::ClubChangeToPutter
                    } else {
                        ControlCode::ClubChangeToDriver
                    };
                    if self.events.send(BusEvent::Control(instruction)).is_err() {
                        warn!("host event queue is gone; dropping club change");
                    }
                }
                None
            }
            other => {
                warn!("received unknown simulator 'SubType' tag: {other}");
                None
            }
        }
    }

    fn challenge_reply(&self, value: &Value) -> String {
        let challenge = value.get("Challenge").and_then(Value::as_str).unwrap_or("");
        let hash = sha256_hex(format!("{challenge}{}", self.config.secret_key).as_bytes());

        serde_json::json!({
            "Type": "Challenge",
            "Developer": self.config.developer_id,
            "Hash": hash,
        })
        .to_string()
    }
}

fn details_of(value: &Value) -> String {
    value
        .get("Details")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

/// Hex-lowercase SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const SHA256_ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn responder() -> (SimResponder, mpsc::Receiver<BusEvent>) {
        let (tx, rx) = mpsc::channel();
        let config = SimResponderConfig {
            developer_id: "DEV-1234".to_string(),
            secret_key: "c".to_string(),
        };
        (SimResponder::new(config, tx), rx)
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(sha256_hex(b"abc"), SHA256_ABC);
    }

    #[test]
    fn challenge_reply_hashes_challenge_and_key() {
        let (responder, _rx) = responder();
        // Challenge "ab" + key "c" hashes "abc".
        let reply = responder
            .process_json(r#"{"Type":"Challenge","Challenge":"ab"}"#)
            .expect("challenge should produce a reply");

        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["Type"], "Challenge");
        assert_eq!(value["Developer"], "DEV-1234");
        assert_eq!(value["Hash"], SHA256_ABC);
    }

    #[test]
    fn handshake_takes_the_challenge_path() {
        let (responder, _rx) = responder();
        let reply = responder
            .process_json(r#"{"Type":"Handshake","Challenge":"ab"}"#)
            .expect("handshake with challenge data should produce a reply");
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["Hash"], SHA256_ABC);
    }

    #[test]
    fn ping_replies_pong() {
        let (responder, _rx) = responder();
        let reply = responder
            .process_json(r#"{"Type":"SimCommand","SubType":"Ping"}"#)
            .expect("ping should produce a reply");
        assert_eq!(reply, "{\"Type\":\"Pong\"}");
    }

    #[test]
    fn arm_and_disarm_flip_the_flag() {
        let (responder, _rx) = responder();
        assert!(!responder.is_armed());

        assert!(responder
            .process_json(r#"{"Type":"SimCommand","SubType":"Arm"}"#)
            .is_none());
        assert!(responder.is_armed());

        assert!(responder
            .process_json(r#"{"Type":"SimCommand","SubType":"Disarm"}"#)
            .is_none());
        assert!(!responder.is_armed());
    }

    #[test]
    fn player_data_forwards_club_change() {
        let (responder, rx) = responder();
        let message = r#"{
            "Type": "SimCommand",
            "SubType": "PlayerDataModified",
            "Details": { "ClubType": "Putter", "Handedness": "RH" }
        }"#;
        assert!(responder.process_json(message).is_none());
        assert_eq!(
            rx.try_recv().unwrap(),
            BusEvent::Control(ControlCode::ClubChangeToPutter)
        );

        let message = r#"{
            "Type": "SimCommand",
            "SubType": "PlayerDataModified",
            "Details": { "ClubType": "Driver" }
        }"#;
        assert!(responder.process_json(message).is_none());
        assert_eq!(
            rx.try_recv().unwrap(),
            BusEvent::Control(ControlCode::ClubChangeToDriver)
        );
    }

    #[test]
    fn malformed_messages_are_counted_and_swallowed() {
        let (responder, _rx) = responder();
        assert!(responder.process_json("{ not json").is_none());
        assert!(responder.process_json("").is_none());
        assert_eq!(responder.malformed_messages(), 2);

        // Valid JSON without a Type tag is not counted as malformed.
        assert!(responder.process_json("{}").is_none());
        assert_eq!(responder.malformed_messages(), 2);
    }

    #[test]
    fn unknown_types_and_subtypes_produce_no_reply() {
        let (responder, _rx) = responder();
        assert!(responder.process_json(r#"{"Type":"Nonsense"}"#).is_none());
        assert!(responder
            .process_json(r#"{"Type":"SimCommand","SubType":"Nonsense"}"#)
            .is_none());
        assert!(responder
            .process_json(r#"{"Type":"ShotComplete"}"#)
            .is_none());
        assert!(responder
            .process_json(r#"{"Type":"ACK","Details":"ok"}"#)
            .is_none());
    }

    #[test]
    fn authentication_checks_success_string() {
        let (responder, _rx) = responder();
        assert!(responder
            .process_json(r#"{"Type":"Authentication","Success":"true"}"#)
            .is_none());
        assert!(responder
            .process_json(r#"{"Type":"Authentication","Success":"false"}"#)
            .is_none());
    }
}
