//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT client for receiving sensor, decoder and manifest messages
//! - `mqtt_egress` - MQTT publisher for session results and metrics
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `egress` - Session reports to file (JSONL format)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod egress;
pub mod egress_channel;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;

// Re-export commonly used types
pub use egress::{run_egress_worker, Egress};
pub use egress_channel::{create_egress_channel, EgressSender};
pub use mqtt_egress::MqttPublisher;
