//! MQTT client for receiving portal sensor data
//!
//! Every payload is a JSON object tagged by `type`:
//! - `distance` - raw ultrasonic sample (`distance_in` or `pulse_us`)
//! - `presence` - presence decided upstream
//! - `reading` - camera or IR decode attempt
//! - `manifest` - replace the manifest (`entries` list or `text` body)

use crate::domain::types::{
    deserialize_timestamp, epoch_ms, ArchwayId, ManifestEntry, ReadingSource, ScanEvent, ScanEventKind,
    TimestampValue,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::manifest_store::Manifest;
use crate::services::presence::pulse_to_inches;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Inbound payload, tagged by `type`
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Distance {
        archway: u8,
        #[serde(default)]
        sensor: u8,
        distance_in: Option<f64>,
        pulse_us: Option<f64>,
        #[serde(default, deserialize_with = "deserialize_timestamp")]
        time: TimestampValue,
    },
    Presence {
        archway: u8,
        present: bool,
        #[serde(default, deserialize_with = "deserialize_timestamp")]
        time: TimestampValue,
    },
    Reading {
        archway: u8,
        source: String,
        code: String,
        confidence: Option<f32>,
        #[serde(default, deserialize_with = "deserialize_timestamp")]
        time: TimestampValue,
    },
    Manifest {
        #[serde(default)]
        entries: Vec<WireEntry>,
        text: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct WireEntry {
    code: String,
    #[serde(default = "default_quantity")]
    quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

/// Parse one MQTT payload into a scan event
///
/// Malformed payloads yield `None`; they are treated as no event at all.
pub fn parse_message(json_str: &str, received_at: Instant) -> Option<ScanEvent> {
    let message: WireMessage = match serde_json::from_str(json_str) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "mqtt_payload_invalid");
            return None;
        }
    };

    let now_ms = epoch_ms();
    let (kind, event_time) = match message {
        WireMessage::Distance { archway, sensor, distance_in, pulse_us, time } => {
            let distance_in = distance_in.or_else(|| pulse_us.map(pulse_to_inches));
            (ScanEventKind::Distance { archway: ArchwayId(archway), sensor, distance_in }, time.to_epoch_ms_or(now_ms))
        }
        WireMessage::Presence { archway, present, time } => {
            (ScanEventKind::Presence { archway: ArchwayId(archway), present }, time.to_epoch_ms_or(now_ms))
        }
        WireMessage::Reading { archway, source, code, confidence, time } => {
            let source: ReadingSource = match source.parse() {
                Ok(s) => s,
                Err(e) => {
                    warn!(archway = %archway, error = %e, "mqtt_reading_source_invalid");
                    return None;
                }
            };
            let confidence = match (source.is_camera(), confidence) {
                (false, _) => 1.0,
                (true, Some(c)) => c,
                (true, None) => {
                    warn!(archway = %archway, source = %source.as_str(), "mqtt_reading_missing_confidence");
                    return None;
                }
            };
            (
                ScanEventKind::Reading { archway: ArchwayId(archway), source, code, confidence },
                time.to_epoch_ms_or(now_ms),
            )
        }
        WireMessage::Manifest { entries, text } => {
            let entries = match text {
                Some(text) if !text.trim().is_empty() => match Manifest::parse_text(&text) {
                    Ok(manifest) => manifest.entries().to_vec(),
                    Err(e) => {
                        warn!(error = %e, "mqtt_manifest_invalid");
                        return None;
                    }
                },
                _ => entries.into_iter().map(|e| ManifestEntry::new(&e.code, e.quantity)).collect(),
            };
            (ScanEventKind::ManifestLoad(entries), now_ms)
        }
    };

    Some(ScanEvent::new(kind, event_time).at(received_at))
}

/// Start the MQTT client and send parsed events to the orchestrator queue
///
/// Events are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped events are counted in metrics and logged (rate-limited).
pub async fn start_mqtt_client(
    config: &Config,
    event_tx: mpsc::Sender<ScanEvent>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client_id = format!("{}-ingress", config.site_id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(config.mqtt_topic(), QoS::AtMostOnce).await?;

    info!(topic = %config.mqtt_topic(), host = %config.mqtt_host(), port = %config.mqtt_port(), "mqtt_client_subscribed");

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let received_at = Instant::now();
                        let json_str = match std::str::from_utf8(&publish.payload) {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(topic = %publish.topic, error = %e, "mqtt_payload_not_utf8");
                                continue;
                            }
                        };

                        let Some(event) = parse_message(json_str, received_at) else {
                            continue;
                        };
                        debug!(topic = %publish.topic, kind = %event.kind.as_str(), "mqtt_event");

                        match event_tx.try_send(event) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                metrics.record_event_dropped();
                                if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                    warn!("mqtt_event_dropped: channel full");
                                    last_drop_warn = Instant::now();
                                }
                            }
                            Err(TrySendError::Closed(_)) => {
                                warn!("event_channel_closed");
                                return Ok(());
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reading() {
        let json = r#"{"type":"reading","archway":1,"source":"camera-left","code":"pal12345","confidence":0.83,"time":1767617600123}"#;
        let event = parse_message(json, Instant::now()).unwrap();
        assert_eq!(event.event_time, 1767617600123);
        assert_eq!(
            event.kind,
            ScanEventKind::Reading {
                archway: ArchwayId(1),
                source: ReadingSource::CameraLeft,
                code: "pal12345".to_string(),
                confidence: 0.83,
            }
        );
    }

    #[test]
    fn test_parse_ir_reading_fixed_confidence() {
        let json = r#"{"type":"reading","archway":2,"source":"ir","code":"PAL1"}"#;
        let event = parse_message(json, Instant::now()).unwrap();
        match event.kind {
            ScanEventKind::Reading { source, confidence, .. } => {
                assert_eq!(source, ReadingSource::Infrared);
                assert_eq!(confidence, 1.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_camera_reading_requires_confidence() {
        let json = r#"{"type":"reading","archway":2,"source":"cam1","code":"PAL1"}"#;
        assert!(parse_message(json, Instant::now()).is_none());
    }

    #[test]
    fn test_parse_distance_from_pulse() {
        let json = r#"{"type":"distance","archway":1,"sensor":1,"pulse_us":1764,"time":"2026-01-05T16:41:30.048+00:00"}"#;
        let event = parse_message(json, Instant::now()).unwrap();
        assert!(event.event_time > 1_767_000_000_000);
        match event.kind {
            ScanEventKind::Distance { sensor, distance_in, .. } => {
                assert_eq!(sensor, 1);
                assert!((distance_in.unwrap() - 12.0).abs() < 1e-9);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parse_presence() {
        let json = r#"{"type":"presence","archway":2,"present":false}"#;
        let event = parse_message(json, Instant::now()).unwrap();
        assert_eq!(event.kind, ScanEventKind::Presence { archway: ArchwayId(2), present: false });
    }

    #[test]
    fn test_parse_manifest_entries_and_text() {
        let json = r#"{"type":"manifest","entries":[{"code":"pal1","quantity":2},{"code":"PAL2"}]}"#;
        let event = parse_message(json, Instant::now()).unwrap();
        assert_eq!(
            event.kind,
            ScanEventKind::ManifestLoad(vec![ManifestEntry::new("PAL1", 2), ManifestEntry::new("PAL2", 1)])
        );

        let json = r#"{"type":"manifest","text":"PAL1, PAL2*3"}"#;
        let event = parse_message(json, Instant::now()).unwrap();
        assert_eq!(
            event.kind,
            ScanEventKind::ManifestLoad(vec![ManifestEntry::new("PAL1", 1), ManifestEntry::new("PAL2", 3)])
        );
    }

    #[test]
    fn test_parse_invalid_payloads() {
        assert!(parse_message("not json", Instant::now()).is_none());
        assert!(parse_message(r#"{"type":"teleport","archway":1}"#, Instant::now()).is_none());
        assert!(parse_message(r#"{"type":"reading","archway":1,"source":"lidar","code":"X","confidence":0.5}"#, Instant::now()).is_none());
    }
}
