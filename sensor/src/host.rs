use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{info, warn};

use climate_common::{
    config::EmulatorBounds, EmulatedSensor, RawReading, RawSensor, TOPIC_SENSOR_HUMIDITY,
    TOPIC_SENSOR_STATUS, TOPIC_SENSOR_TEMP,
};

const PUBLISH_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("climate-sensor", mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    mqtt.publish(TOPIC_SENSOR_STATUS, QoS::AtLeastOnce, true, "online")
        .await
        .context("failed to publish sensor online status")?;

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("sensor mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    let mut raw = EmulatedSensor::new(EmulatorBounds::default());
    info!("sensor publisher started");

    let mut interval = tokio::time::interval(PUBLISH_INTERVAL);

    loop {
        interval.tick().await;

        let reading = match raw.read() {
            Ok(reading) => reading,
            Err(err) => {
                warn!("sensor read failed, skipping publish: {err}");
                continue;
            }
        };
        let (temp_payload, humidity_payload) = format_reading(reading);

        mqtt.publish(TOPIC_SENSOR_TEMP, QoS::AtLeastOnce, true, temp_payload)
            .await
            .context("failed to publish sensor temperature")?;
        mqtt.publish(
            TOPIC_SENSOR_HUMIDITY,
            QoS::AtLeastOnce,
            true,
            humidity_payload,
        )
        .await
        .context("failed to publish sensor humidity")?;
    }
}

fn format_reading(reading: RawReading) -> (String, String) {
    (
        format!("{:.1}", reading.temperature),
        format!("{:.1}", reading.humidity),
    )
}
