//! Embedded MQTT broker using rumqttd
//!
//! Lets a single portal box run without external infrastructure: sensors,
//! decoders and downstream consumers all connect to this broker.

use crate::infra::config::Config as AppConfig;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Readings and presence messages are small; manifests may carry a few thousand codes
const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Build the rumqttd configuration, or `None` if the bind address is invalid
pub fn broker_config(app_config: &AppConfig) -> Option<Config> {
    let addr_str = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    let listen: SocketAddr = match addr_str.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, addr = %addr_str, "broker_invalid_bind_address");
            return None;
        }
    };

    let router = RouterConfig {
        max_segment_size: 10 * 1024 * 1024,
        max_segment_count: 10,
        max_connections: 256,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let server = ServerSettings {
        name: "v4".to_string(),
        listen,
        tls: None,
        next_connection_delay_ms: 1,
        connections: ConnectionSettings {
            connection_timeout_ms: 5000,
            max_payload_size: MAX_PAYLOAD_SIZE,
            max_inflight_count: 200,
            auth: None,
            dynamic_filters: false,
            external_auth: None,
        },
    };

    Some(Config {
        id: 0,
        router,
        v4: Some(HashMap::from([("v4".to_string(), server)])),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    })
}

/// Start the embedded broker on its own thread
///
/// Returns false when disabled or misconfigured.
pub fn start_embedded_broker(app_config: &AppConfig) -> bool {
    if !app_config.broker_enabled() {
        info!("broker_disabled");
        return false;
    }
    let Some(config) = broker_config(app_config) else {
        return false;
    };

    thread::spawn(move || {
        let mut broker = Broker::new(config);
        // start() blocks for the life of the broker
        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    // Let the listener bind before clients connect
    thread::sleep(Duration::from_millis(100));
    info!(bind_address = %app_config.broker_bind_address(), port = %app_config.broker_port(), "broker_started");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config_listens_on_configured_port() {
        let config = broker_config(&AppConfig::default()).unwrap();
        let servers = config.v4.unwrap();
        let server = &servers["v4"];
        assert_eq!(server.listen.port(), AppConfig::default().broker_port());
        assert_eq!(server.connections.max_payload_size, MAX_PAYLOAD_SIZE);
    }
}
