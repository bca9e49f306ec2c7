//! Portal simulator - publishes scan scenarios to the broker
//!
//! Drives a running pallet-portal over MQTT with scripted manifest, presence
//! and decode messages, and prints the session results it publishes back.
//!
//! Usage:
//!   cargo run --bin portal-sim -- --scenario happy
//!   cargo run --bin portal-sim -- --scenario all --host 10.0.0.5
//!   cargo run --bin portal-sim -- --manifest barcodes.txt --scenario dual

use clap::{Parser, ValueEnum};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Parser, Debug)]
#[command(name = "portal-sim", about = "Publish pallet portal scan scenarios over MQTT")]
struct Args {
    /// Broker host
    #[arg(long, default_value = "localhost")]
    host: String,
    /// Broker port
    #[arg(long, default_value_t = 1883)]
    port: u16,
    /// Topic the portal subscribes to
    #[arg(long, default_value = "portal/in/sim")]
    topic: String,
    /// Topic the portal publishes results on
    #[arg(long, default_value = "portal/results")]
    results_topic: String,
    /// Scenario to run
    #[arg(long, value_enum, default_value_t = Scenario::Happy)]
    scenario: Scenario,
    /// Publish this manifest file (barcodes.txt format) instead of the scenario's own
    #[arg(long)]
    manifest: Option<String>,
    /// Capture window configured on the portal (ms)
    #[arg(long, default_value_t = 2000)]
    window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Camera and IR agree on one pallet
    Happy,
    /// Single camera read only
    CameraOnly,
    /// Camera and IR disagree by one character
    NearDuplicate,
    /// No reads during the window
    Empty,
    /// Both archways triggered together on a two-pallet job; each pass lists the other pallet missing
    Dual,
    /// Pallet backs out mid-capture
    Abort,
    /// Every scenario in sequence
    All,
}

/// One scripted message, published `delay_ms` after the previous one
struct Step {
    delay_ms: u64,
    payload: Value,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn step(delay_ms: u64, payload: Value) -> Step {
    Step { delay_ms, payload }
}

fn presence(archway: u8, present: bool) -> Value {
    json!({"type": "presence", "archway": archway, "present": present})
}

fn camera(archway: u8, side: &str, code: &str, confidence: f32) -> Value {
    json!({"type": "reading", "archway": archway, "source": side, "code": code, "confidence": confidence})
}

fn infrared(archway: u8, code: &str) -> Value {
    json!({"type": "reading", "archway": archway, "source": "ir", "code": code})
}

fn manifest(entries: &[(&str, u32)]) -> Value {
    let entries: Vec<Value> = entries.iter().map(|(code, qty)| json!({"code": code, "quantity": qty})).collect();
    json!({"type": "manifest", "entries": entries})
}

/// Steps for one scenario; `window_ms` sizes the pauses so windows close
fn scenario_steps(scenario: Scenario, window_ms: u64) -> Vec<Step> {
    let settle = window_ms + 500;
    match scenario {
        Scenario::Happy => vec![
            step(0, manifest(&[("PAL12345", 1)])),
            step(100, presence(1, true)),
            step(300, camera(1, "camera-left", "PAL12345", 0.83)),
            step(150, infrared(1, "PAL12345")),
            step(settle, presence(1, false)),
        ],
        Scenario::CameraOnly => vec![
            step(0, manifest(&[("PAL111", 1)])),
            step(100, presence(1, true)),
            step(500, camera(1, "camera-right", "PAL111", 0.7)),
            step(settle, presence(1, false)),
        ],
        Scenario::NearDuplicate => vec![
            step(0, manifest(&[("PAL223", 1)])),
            step(100, presence(1, true)),
            step(200, camera(1, "camera-left", "PAL222", 0.9)),
            step(50, infrared(1, "PAL223")),
            step(settle, presence(1, false)),
        ],
        Scenario::Empty => vec![
            step(0, manifest(&[("PAL999", 1)])),
            step(100, presence(1, true)),
            step(settle, presence(1, false)),
        ],
        Scenario::Dual => vec![
            step(0, manifest(&[("PAL1", 1), ("PAL2", 1)])),
            step(100, presence(1, true)),
            step(10, presence(2, true)),
            step(400, camera(1, "camera-left", "PAL1", 0.9)),
            step(settle, camera(2, "camera-left", "PAL2", 0.9)),
            step(settle, presence(1, false)),
            step(0, presence(2, false)),
        ],
        Scenario::Abort => vec![
            step(0, manifest(&[("PAL1", 1)])),
            step(100, presence(1, true)),
            step(300, camera(1, "camera-left", "PAL1", 0.9)),
            step(300, presence(1, false)),
        ],
        Scenario::All => [
            Scenario::Happy,
            Scenario::CameraOnly,
            Scenario::NearDuplicate,
            Scenario::Empty,
            Scenario::Dual,
            Scenario::Abort,
        ]
        .into_iter()
        .flat_map(|s| scenario_steps(s, window_ms))
        .collect(),
    }
}

/// Replace every manifest step with the contents of a barcodes file
fn with_manifest_file(steps: Vec<Step>, text: &str) -> Vec<Step> {
    steps
        .into_iter()
        .map(|s| match s.payload["type"].as_str() {
            Some("manifest") => step(s.delay_ms, json!({"type": "manifest", "text": text})),
            _ => s,
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut steps = scenario_steps(args.scenario, args.window_ms);
    if let Some(path) = &args.manifest {
        let text = std::fs::read_to_string(path)?;
        steps = with_manifest_file(steps, &text);
    }

    let client_id = format!("portal-sim-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, &args.host, args.port);
    options.set_keep_alive(Duration::from_secs(10));
    let (client, mut eventloop) = AsyncClient::new(options, 100);
    client.subscribe(&args.results_topic, QoS::AtLeastOnce).await?;

    // Print results as the portal publishes them
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let text = String::from_utf8_lossy(&publish.payload);
                    match serde_json::from_str::<Value>(&text) {
                        Ok(v) => println!(
                            "<- archway {} {} {} codes={}",
                            v["archway"],
                            v["outcome"].as_str().unwrap_or("?"),
                            v["reason"].as_str().unwrap_or("-"),
                            v["codes"].as_array().map_or(0, |c| c.len())
                        ),
                        Err(_) => println!("<- {text}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("mqtt error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    println!("running {:?} ({} messages) against {}:{}", args.scenario, steps.len(), args.host, args.port);
    for Step { delay_ms, mut payload } in steps {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        if payload["type"] != "manifest" {
            payload["time"] = json!(now_ms());
        }
        println!("-> {payload}");
        client.publish(&args.topic, QoS::AtLeastOnce, false, payload.to_string()).await?;
    }

    // Leave time for the last window to close and its result to arrive
    tokio::time::sleep(Duration::from_millis(args.window_ms + 1500)).await;
    Ok(())
}
