mod sensor;

use chrono::Utc;
use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use sensor::SensorData;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(about = "Publishes synthetic sensor readings over MQTT")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "MQTT_TOPIC", default_value = "sensor/data")]
    topic: String,

    /// Messages per second
    #[arg(long, env = "RATE", default_value_t = 1000)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: usize,

    /// Share of messages that fail validation on purpose
    #[arg(long, env = "INVALID_RATIO", default_value_t = 0.02)]
    invalid_ratio: f64,

    /// Share of messages sent without a timestamp
    #[arg(long, env = "UNTIMED_RATIO", default_value_t = 0.5)]
    untimed_ratio: f64,
}

const BURST_SIZE: usize = 200;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let rate = args.rate.max(1);

    info!("Starting sensor simulator");
    info!(
        "Broker: {}:{}, Topic: {}, Rate: {} msg/s, Devices: {}",
        args.broker, args.port, args.topic, rate, args.devices
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());

    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Connected to MQTT broker, starting to publish sensor data");

    let mut rng = rand::thread_rng();
    let mut counter = 0u64;
    let devices = args.devices.max(1) as u64;

    let burst_interval = Duration::from_millis((BURST_SIZE as u64 * 1000) / rate);

    info!("Publishing in bursts of {} messages every {:?}", BURST_SIZE, burst_interval);

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..BURST_SIZE {
            let device_id = format!("dev-{}", counter % devices);
            let data = generate_reading(&mut rng, device_id, &args);

            let payload = match serde_json::to_string(&data) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize sensor data: {}", e);
                    continue;
                }
            };

            match client
                .publish(&args.topic, QoS::AtMostOnce, false, payload)
                .await
            {
                Ok(_) => counter += 1,
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        if counter % 10000 == 0 {
            info!("Published {} messages", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - system may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}

fn generate_reading(rng: &mut impl Rng, device_id: String, args: &Args) -> SensorData {
    let mut data = SensorData {
        device_id,
        temperature: rng.gen_range(15.0..35.0),
        humidity: rng.gen_range(30.0..80.0),
        luminosity: rng.gen_range(0..1200),
        timestamp: if rng.gen_bool(args.untimed_ratio.clamp(0.0, 1.0)) {
            None
        } else {
            Some(Utc::now())
        },
    };

    // Push one field out of range so the ingestor has something to reject
    if rng.gen_bool(args.invalid_ratio.clamp(0.0, 1.0)) {
        match rng.gen_range(0..3) {
            0 => data.temperature = rng.gen_range(101.0..200.0),
            1 => data.humidity = rng.gen_range(101.0..150.0),
            _ => data.luminosity = -rng.gen_range(1..100),
        }
    }

    data
}
