mod pump;
mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use telemetry::{fake_frame, ControlConfig, SensorModel};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Field device and camera agent for the aeroponics hub.
#[derive(Parser, Debug)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = "aeroponics")]
    prefix: String,

    /// Milliseconds between sensor readings
    #[arg(long, env = "METRICS_INTERVAL_MS", default_value_t = 2000)]
    metrics_interval_ms: u64,

    /// Milliseconds between camera frames
    #[arg(long, env = "FRAME_INTERVAL_MS", default_value_t = 1000)]
    frame_interval_ms: u64,

    #[arg(long, env = "FRAME_BYTES", default_value_t = 32 * 1024)]
    frame_bytes: usize,

    /// Camera silently stops after this many seconds, to exercise the hub's
    /// staleness timeout
    #[arg(long, env = "CAMERA_DROPOUT_SECS")]
    camera_dropout_secs: Option<u64>,

    #[arg(long)]
    no_camera: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting aeroponics simulator");
    info!(
        "Broker: {}:{}, prefix: {}, metrics every {}ms, frames every {}ms",
        args.broker, args.port, args.prefix, args.metrics_interval_ms, args.frame_interval_ms
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(4 * 1024 * 1024, 4 * 1024 * 1024);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    let controls_topic = format!("{}/controls", args.prefix);
    let (controls_tx, controls_rx) = watch::channel::<Option<ControlConfig>>(None);

    // The device pulls its configuration from the retained controls topic.
    // A clean session forgets subscriptions, so resubscribe on every ConnAck.
    let eventloop_client = client.clone();
    let eventloop_topic = controls_topic.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(event) => match classify(&event, &eventloop_topic) {
                    DeviceEvent::Connected => {
                        info!("Connected, subscribing to {}", eventloop_topic);
                        if let Err(e) = eventloop_client.try_subscribe(&eventloop_topic, QoS::AtLeastOnce) {
                            error!("Failed to subscribe to {}: {}", eventloop_topic, e);
                        }
                    }
                    DeviceEvent::Controls(config) => {
                        info!("Applying control configuration: {:?}", config);
                        controls_tx.send_replace(Some(config));
                    }
                    DeviceEvent::Malformed(e) => warn!("Ignoring malformed controls: {}", e),
                    DeviceEvent::Other => {}
                },
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    tokio::spawn(pump::run_pump_scheduler(controls_rx.clone()));

    let metrics_handle = tokio::spawn(run_field_device(
        client.clone(),
        format!("{}/metrics", args.prefix),
        Duration::from_millis(args.metrics_interval_ms),
        controls_rx,
    ));

    let stream_topic = format!("{}/stream", args.prefix);
    let camera_handle = if args.no_camera {
        None
    } else {
        Some(tokio::spawn(run_camera(
            client.clone(),
            stream_topic.clone(),
            Duration::from_millis(args.frame_interval_ms),
            args.frame_bytes,
            args.camera_dropout_secs.map(Duration::from_secs),
        )))
    };

    tokio::select! {
        _ = metrics_handle => {
            error!("Field device task terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    if let Some(handle) = camera_handle {
        handle.abort();
        // Explicit empty frame tells the hub the camera went away
        if let Err(e) = client.publish(&stream_topic, QoS::AtLeastOnce, false, Vec::new()).await {
            warn!("Failed to publish offline frame: {}", e);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("Simulator stopped");
}

#[derive(Debug)]
enum DeviceEvent {
    Connected,
    Controls(ControlConfig),
    Malformed(String),
    Other,
}

fn classify(event: &Event, controls_topic: &str) -> DeviceEvent {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => DeviceEvent::Connected,
        Event::Incoming(Packet::Publish(publish)) if publish.topic == controls_topic => {
            match serde_json::from_slice::<ControlConfig>(&publish.payload) {
                Ok(config) => DeviceEvent::Controls(config),
                Err(e) => DeviceEvent::Malformed(e.to_string()),
            }
        }
        _ => DeviceEvent::Other,
    }
}

async fn run_field_device(
    client: AsyncClient,
    topic: String,
    interval: Duration,
    controls: watch::Receiver<Option<ControlConfig>>,
) {
    let mut model = SensorModel::default();
    let mut ticker = tokio::time::interval(interval);
    let mut counter = 0u64;

    loop {
        ticker.tick().await;

        let snapshot = {
            let mut rng = rand::thread_rng();
            let current = controls.borrow();
            model.step(&mut rng, (*current).as_ref())
        };

        let payload = match serde_json::to_vec(&snapshot) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize telemetry: {}", e);
                continue;
            }
        };

        match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            Ok(()) => counter += 1,
            Err(e) => warn!("Failed to publish telemetry: {}", e),
        }

        if counter % 30 == 0 {
            info!("Published {} readings", counter);
        }
    }
}

async fn run_camera(
    client: AsyncClient,
    topic: String,
    interval: Duration,
    frame_bytes: usize,
    dropout_after: Option<Duration>,
) {
    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        if dropout_after.is_some_and(|d| started.elapsed() >= d) {
            warn!("Camera dropping out without notice");
            return;
        }

        let frame = {
            let mut rng = rand::thread_rng();
            // Frame sizes vary a little like real JPEG output
            let size = frame_bytes + rng.gen_range(0..frame_bytes / 8 + 1);
            fake_frame(&mut rng, size)
        };

        if let Err(e) = client.publish(&topic, QoS::AtMostOnce, false, frame).await {
            warn!("Failed to publish frame: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish};

    const TOPIC: &str = "aeroponics/controls";

    #[test]
    fn test_every_connack_triggers_subscribe() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)));
        // First connect and a reconnect after a broker restart look the same
        assert!(matches!(classify(&connack, TOPIC), DeviceEvent::Connected));
        assert!(matches!(classify(&connack, TOPIC), DeviceEvent::Connected));
    }

    #[test]
    fn test_retained_controls_are_decoded() {
        let payload = br#"{"tempRange":24,"phRange":6.2,"pumpCycle":{"onFor":30,"offFor":300},"nutrientPumpRunningTime":600}"#;
        let event = Event::Incoming(Packet::Publish(Publish::new(TOPIC, QoS::AtLeastOnce, payload.to_vec())));
        match classify(&event, TOPIC) {
            DeviceEvent::Controls(config) => assert_eq!(config.pump_cycle.off_for, 300),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_other_topics_and_garbage() {
        let other = Event::Incoming(Packet::Publish(Publish::new("aeroponics/metrics", QoS::AtLeastOnce, b"{}".to_vec())));
        assert!(matches!(classify(&other, TOPIC), DeviceEvent::Other));

        let garbage = Event::Incoming(Packet::Publish(Publish::new(TOPIC, QoS::AtLeastOnce, b"nope".to_vec())));
        assert!(matches!(classify(&garbage, TOPIC), DeviceEvent::Malformed(_)));
    }
}
