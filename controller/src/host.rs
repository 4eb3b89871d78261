use std::{
    collections::HashMap, io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex, time::MissedTickBehavior};
use tracing::{info, warn};

use climate_common::{
    config::{is_valid_target, SensorConfig},
    ControllerEvent, ControllerSnapshot, EmulatedSensor, EnergyMode, Hvac, HvacRelays,
    PreferencesPatch, RawReading, RawSensor, Routine, RuntimeConfig, ScheduleItem,
    ScheduleSelector, SensorError, SensorKind, SettingsPatch, TemperatureSensor,
    ThermostatController, ThermostatMode, TOPIC_CMD_ENERGY_MODE, TOPIC_CMD_MODE,
    TOPIC_CMD_TARGET, TOPIC_CONTROLLER_STATE, TOPIC_SENSOR_HUMIDITY, TOPIC_SENSOR_TEMP,
};

#[derive(Clone)]
struct AppState {
    controller: Arc<Mutex<ThermostatController>>,
    timezone: Arc<String>,
    remote: RemoteFeed,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    timezone: String,
    #[serde(rename = "nowEpochMs")]
    now_epoch_ms: u64,
    local: String,
}

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Default, Clone, Copy)]
struct RemoteSample {
    temperature: Option<f32>,
    humidity: Option<f32>,
    temperature_at_ms: u64,
}

/// Readings received over MQTT from a remote sensor node.
#[derive(Clone)]
struct RemoteFeed {
    latest: Arc<std::sync::Mutex<RemoteSample>>,
    stale_after_ms: u64,
}

impl RemoteFeed {
    fn new(stale_after_ms: u64) -> Self {
        Self {
            latest: Arc::new(std::sync::Mutex::new(RemoteSample::default())),
            stale_after_ms,
        }
    }

    fn update(&self, temperature: Option<f32>, humidity: Option<f32>, now_ms: u64) {
        let Ok(mut latest) = self.latest.lock() else {
            warn!("remote sensor feed lock poisoned");
            return;
        };
        if temperature.is_some() {
            latest.temperature = temperature;
            latest.temperature_at_ms = now_ms;
        }
        if humidity.is_some() {
            latest.humidity = humidity;
        }
    }

    fn sample_at(&self, now_ms: u64) -> Result<RawReading, SensorError> {
        let latest = *self
            .latest
            .lock()
            .map_err(|_| SensorError::Hardware("remote sensor feed lock poisoned".into()))?;
        let temperature = latest.temperature.ok_or(SensorError::NoData)?;
        let age_ms = now_ms.saturating_sub(latest.temperature_at_ms);
        if age_ms > self.stale_after_ms {
            return Err(SensorError::Stale { age_ms });
        }
        Ok(RawReading {
            temperature,
            humidity: latest.humidity.unwrap_or_default(),
        })
    }
}

impl RawSensor for RemoteFeed {
    fn read(&mut self) -> Result<RawReading, SensorError> {
        self.sample_at(epoch_ms(Utc::now().fixed_offset()))
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let runtime = store
        .load_runtime_config()
        .await
        .context("failed to load runtime config from store")?;
    runtime.validate().context("invalid runtime config")?;
    if runtime.timezone.parse::<Tz>().is_err() {
        warn!("unknown timezone {:?}, falling back to UTC", runtime.timezone);
    }

    let now_ms = epoch_ms(now_in_timezone(&runtime.timezone));
    let remote = RemoteFeed::new(runtime.sensor.stale_after_ms);
    let sensor = build_sensor(&runtime.sensor, &remote);
    let hvac = Hvac::new(
        &runtime.hvac,
        HvacRelays::emulated(&runtime.hvac),
        runtime.times,
        now_ms,
    );
    let controller = ThermostatController::new(&runtime, sensor, hvac, now_ms);

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("climate-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        controller: Arc::new(Mutex::new(controller)),
        timezone: Arc::new(runtime.timezone.clone()),
        remote,
        mqtt,
        store,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone(), runtime.clock_speed_ms);

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/target", post(handle_set_target))
        .route("/api/mode", post(handle_set_mode))
        .route("/api/energy-mode", post(handle_set_energy_mode))
        .route("/api/settings", patch(handle_patch_settings))
        .route(
            "/api/schedule",
            get(handle_get_schedule)
                .put(handle_put_schedule)
                .post(handle_post_schedule)
                .delete(handle_delete_schedule),
        )
        .route(
            "/api/routines",
            get(handle_get_routines).put(handle_put_routines),
        )
        .route(
            "/api/preferences",
            get(handle_get_preferences).patch(handle_patch_preferences),
        )
        .route("/api/time", get(handle_get_time))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.http_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_sensor(config: &SensorConfig, remote: &RemoteFeed) -> TemperatureSensor {
    let raw: Box<dyn RawSensor> = match config.kind {
        SensorKind::Emulated => Box::new(EmulatedSensor::new(config.emulator)),
        SensorKind::Remote => Box::new(remote.clone()),
        SensorKind::Dht11 | SensorKind::Dht22 => {
            warn!(
                "{:?} sensor needs the esp32 build, using the emulator",
                config.kind
            );
            Box::new(EmulatedSensor::new(config.emulator))
        }
    };
    TemperatureSensor::new(config, raw)
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [
        TOPIC_SENSOR_TEMP,
        TOPIC_SENSOR_HUMIDITY,
        TOPIC_CMD_TARGET,
        TOPIC_CMD_MODE,
        TOPIC_CMD_ENERGY_MODE,
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// The only caller of `tick`. Persistence runs in its own task so a slow disk
/// never delays the next tick.
fn spawn_control_loop(app_state: AppState, clock_speed_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(clock_speed_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let now = now_in_timezone(&app_state.timezone);
            let now_ms = epoch_ms(now);

            let (events, snapshot) = {
                let mut controller = app_state.controller.lock().await;
                let events = controller.tick(now);
                (events, controller.snapshot(now_ms))
            };

            publish_snapshot(&app_state.mqtt, &snapshot).await;

            if events.iter().any(ControllerEvent::requires_persist) {
                let app_state = app_state.clone();
                tokio::spawn(async move {
                    if let Err(err) = persist_runtime_from_state(&app_state).await {
                        warn!("failed to persist controller state: {err:#}");
                    }
                });
            }
        }
    });
}

async fn publish_snapshot(mqtt: &AsyncClient, snapshot: &ControllerSnapshot) {
    match serde_json::to_vec(snapshot) {
        Ok(body) => {
            if let Err(err) = mqtt
                .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                .await
            {
                warn!("controller state publish failed: {err}");
            }
        }
        Err(err) => warn!("controller state serialization failed: {err}"),
    }
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let message = message.trim();
    let now_ms = epoch_ms(now_in_timezone(&app_state.timezone));

    match topic.as_str() {
        TOPIC_SENSOR_TEMP => {
            if let Ok(temp) = message.parse::<f32>() {
                if temp.is_finite() && (-40.0..=150.0).contains(&temp) {
                    app_state.remote.update(Some(temp), None, now_ms);
                }
            }
        }
        TOPIC_SENSOR_HUMIDITY => {
            if let Ok(humidity) = message.parse::<f32>() {
                if humidity.is_finite() && (0.0..=100.0).contains(&humidity) {
                    app_state.remote.update(None, Some(humidity), now_ms);
                }
            }
        }
        TOPIC_CMD_TARGET => {
            if let Ok(target) = message.parse::<f32>() {
                let changed = app_state.controller.lock().await.set_target(target);
                if changed {
                    persist_runtime_from_state(app_state).await?;
                }
            }
        }
        TOPIC_CMD_MODE => {
            if let Some(mode) = ThermostatMode::parse(message) {
                let changed = app_state.controller.lock().await.set_mode(mode, now_ms);
                if changed {
                    persist_runtime_from_state(app_state).await?;
                }
            }
        }
        TOPIC_CMD_ENERGY_MODE => {
            if let Some(energy_mode) = EnergyMode::parse(message) {
                let changed = app_state
                    .controller
                    .lock()
                    .await
                    .set_energy_mode(energy_mode);
                if changed {
                    persist_runtime_from_state(app_state).await?;
                }
            }
        }
        _ => {}
    }

    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let now_ms = epoch_ms(now_in_timezone(&state.timezone));
    let snapshot = state.controller.lock().await.snapshot(now_ms);
    Json(snapshot)
}

async fn handle_set_target(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(target) = value.parse::<f32>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };
    if !is_valid_target(target) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Target must be strictly between 50 and 90",
        );
    }

    let changed = state.controller.lock().await.set_target(target);
    persist_if_changed(state, changed, "target").await
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(mode) = ThermostatMode::parse(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid mode. Use AUTO, IDLE, CIRCULATE, COOL, HEAT or HEAT_AUX",
        );
    };

    let now_ms = epoch_ms(now_in_timezone(&state.timezone));
    let changed = state.controller.lock().await.set_mode(mode, now_ms);
    persist_if_changed(state, changed, "mode").await
}

async fn handle_set_energy_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(energy_mode) = EnergyMode::parse(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid energy mode. Use away, eco or normal",
        );
    };

    let changed = state.controller.lock().await.set_energy_mode(energy_mode);
    persist_if_changed(state, changed, "energy mode").await
}

/// Applies several settings at once. An out-of-range target is skipped while
/// the remaining fields still apply.
async fn handle_patch_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> impl IntoResponse {
    let now_ms = epoch_ms(now_in_timezone(&state.timezone));
    let changed = state.controller.lock().await.apply_settings(patch, now_ms);
    persist_if_changed(state, changed, "settings").await
}

async fn persist_if_changed(
    state: AppState,
    changed: bool,
    what: &str,
) -> axum::response::Response {
    if changed {
        if let Err(err) = persist_runtime_from_state(&state).await {
            warn!("failed to persist {what} update: {err:#}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist runtime settings",
            );
        }
    }

    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_schedule(State(state): State<AppState>) -> impl IntoResponse {
    let schedule = state.controller.lock().await.schedule().list().to_vec();
    Json(schedule)
}

async fn handle_put_schedule(
    State(state): State<AppState>,
    Json(items): Json<Vec<ScheduleItem>>,
) -> impl IntoResponse {
    let now_ms = epoch_ms(now_in_timezone(&state.timezone));
    state.controller.lock().await.set_schedule(items, now_ms);
    persist_schedule(state).await
}

async fn handle_post_schedule(
    State(state): State<AppState>,
    Json(items): Json<Vec<ScheduleItem>>,
) -> impl IntoResponse {
    let now_ms = epoch_ms(now_in_timezone(&state.timezone));
    state.controller.lock().await.add_schedule(items, now_ms);
    persist_schedule(state).await
}

async fn handle_delete_schedule(
    State(state): State<AppState>,
    Json(selectors): Json<Vec<ScheduleSelector>>,
) -> impl IntoResponse {
    state.controller.lock().await.remove_schedule(&selectors);
    persist_schedule(state).await
}

async fn persist_schedule(state: AppState) -> axum::response::Response {
    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist schedule update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist schedule",
        );
    }

    handle_get_schedule(State(state)).await.into_response()
}

async fn handle_get_routines(State(state): State<AppState>) -> impl IntoResponse {
    let routines = state.controller.lock().await.routines().to_vec();
    Json(routines)
}

async fn handle_put_routines(
    State(state): State<AppState>,
    Json(routines): Json<Vec<Routine>>,
) -> impl IntoResponse {
    let result = state.controller.lock().await.set_routines(routines);
    if let Err(err) = result {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }

    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist routines update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist routines",
        );
    }

    handle_get_routines(State(state)).await.into_response()
}

async fn handle_get_preferences(State(state): State<AppState>) -> impl IntoResponse {
    let preferences = state.controller.lock().await.preferences().clone();
    Json(preferences)
}

async fn handle_patch_preferences(
    State(state): State<AppState>,
    Json(patch): Json<PreferencesPatch>,
) -> impl IntoResponse {
    let result = state.controller.lock().await.apply_preferences(&patch);
    if let Err(err) = result {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }

    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist preferences update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist preferences",
        );
    }

    handle_get_preferences(State(state)).await.into_response()
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let now = now_in_timezone(&state.timezone);
    Json(TimeStatus {
        timezone: state.timezone.to_string(),
        now_epoch_ms: epoch_ms(now),
        local: now.to_rfc3339(),
    })
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("CLIMATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.climate"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Merges the controller's state into the stored config. The store lock
    /// is held from load to save so concurrent persists land in order.
    async fn persist(&self, controller: &Mutex<ThermostatController>) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut runtime = self.read().await?;
        controller.lock().await.export_into(&mut runtime);
        self.write(&runtime).await
    }

    async fn read(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

async fn persist_runtime_from_state(state: &AppState) -> anyhow::Result<()> {
    state.store.persist(&state.controller).await
}

/// Local wall clock in `timezone`, or UTC when the name is unknown.
fn now_in_timezone(timezone: &str) -> DateTime<FixedOffset> {
    let now = Utc::now();
    match timezone.parse::<Tz>() {
        Ok(tz) => {
            let local = now.with_timezone(&tz);
            local.with_timezone(&local.offset().fix())
        }
        Err(_) => now.fixed_offset(),
    }
}

fn epoch_ms(now: DateTime<FixedOffset>) -> u64 {
    u64::try_from(now.timestamp_millis()).unwrap_or(0)
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
