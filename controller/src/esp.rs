use std::{
    sync::{
        mpsc::{self, SyncSender, TrySendError},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use dht_sensor::{dht11, dht22};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{
        Details, EspMqttClient, EspMqttConnection, EventPayload, MqttClientConfiguration, QoS,
    },
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi},
};
use log::{info, warn};

use climate_common::{
    config::{NetworkConfig, SensorConfig},
    ControllerEvent, DigitalOutput, EmulatedSensor, EnergyMode, Hvac, HvacRelays, OutputError,
    RawReading, RawSensor, RuntimeConfig, SensorError, SensorKind, TemperatureSensor,
    ThermostatController, ThermostatMode, TOPIC_CMD_ENERGY_MODE, TOPIC_CMD_MODE,
    TOPIC_CMD_TARGET, TOPIC_CONTROLLER_STATE,
};

const NVS_NAMESPACE: &str = "climate";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_BUFFER_BYTES: usize = 8192;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const SNTP_POLL_MS: u64 = 500;

#[derive(Clone)]
struct SharedState {
    controller: Arc<Mutex<ThermostatController>>,
    timezone: Arc<String>,
}

impl SharedState {
    fn controller(&self) -> MutexGuard<'_, ThermostatController> {
        self.controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// Relay coil driven straight from a GPIO line.
struct PinOutput {
    pin: i32,
    driver: PinDriver<'static, AnyOutputPin, Output>,
}

impl PinOutput {
    fn new(pin: i32) -> anyhow::Result<Self> {
        let mut driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
            .with_context(|| format!("failed to claim relay GPIO{pin}"))?;
        driver.set_low()?;
        Ok(Self { pin, driver })
    }
}

impl DigitalOutput for PinOutput {
    fn write(&mut self, high: bool) -> Result<(), OutputError> {
        let result = if high {
            self.driver.set_high()
        } else {
            self.driver.set_low()
        };
        result.map_err(|err| OutputError::Write {
            pin: self.pin,
            reason: err.to_string(),
        })
    }

    fn read(&self) -> bool {
        self.driver.is_set_high()
    }
}

/// Single-wire DHT11/DHT22 probe. Readings are converted to Fahrenheit.
struct DhtSensor {
    kind: SensorKind,
    pin: i32,
    driver: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl DhtSensor {
    fn new(kind: SensorKind, pin: i32) -> anyhow::Result<Self> {
        let mut driver = unsafe { PinDriver::input_output_od(AnyIOPin::new(pin)) }
            .with_context(|| format!("failed to claim DHT GPIO{pin}"))?;
        driver.set_pull(Pull::Up)?;
        driver.set_high()?;
        Ok(Self {
            kind,
            pin,
            driver,
            delay: Ets,
        })
    }
}

fn celsius_to_fahrenheit(celsius: f32) -> f32 {
    celsius * 9.0 / 5.0 + 32.0
}

impl RawSensor for DhtSensor {
    fn read(&mut self) -> Result<RawReading, SensorError> {
        self.driver
            .set_high()
            .map_err(|err| SensorError::Hardware(format!("GPIO{}: {err}", self.pin)))?;

        let (celsius, humidity) = match self.kind {
            SensorKind::Dht11 => dht11::blocking::read(&mut self.delay, &mut self.driver)
                .map(|reading| {
                    (
                        f32::from(reading.temperature),
                        f32::from(reading.relative_humidity),
                    )
                })
                .map_err(|err| SensorError::Hardware(format!("DHT11: {err:?}")))?,
            _ => dht22::blocking::read(&mut self.delay, &mut self.driver)
                .map(|reading| (reading.temperature, reading.relative_humidity))
                .map_err(|err| SensorError::Hardware(format!("DHT22: {err:?}")))?,
        };

        Ok(RawReading {
            temperature: celsius_to_fahrenheit(celsius),
            humidity,
        })
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.validate().context("invalid runtime config")?;
    if runtime.timezone.parse::<Tz>().is_err() {
        warn!("unknown timezone {:?}, falling back to UTC", runtime.timezone);
    }

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    while sntp.get_sync_status() != SyncStatus::Completed {
        thread::sleep(Duration::from_millis(SNTP_POLL_MS));
    }
    info!("SNTP synchronized");

    let now_ms = epoch_ms(now_in_timezone(&runtime.timezone));
    let wiring = runtime.hvac.wiring;
    let relays = HvacRelays::new(
        Box::new(PinOutput::new(wiring.compressor)?),
        Box::new(PinOutput::new(wiring.heat_pump)?),
        Box::new(PinOutput::new(wiring.aux_heat)?),
        Box::new(PinOutput::new(wiring.fan)?),
    );
    let hvac = Hvac::new(&runtime.hvac, relays, runtime.times, now_ms);
    let sensor = build_sensor(&runtime.sensor)?;
    let controller = ThermostatController::new(&runtime, sensor, hvac, now_ms);

    let shared_state = SharedState {
        controller: Arc::new(Mutex::new(controller)),
        timezone: Arc::new(runtime.timezone.clone()),
    };

    let persist = spawn_persister(shared_state.clone(), nvs_store)?;

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));
    subscribe_topics(&mqtt_client)?;
    spawn_mqtt_receiver(
        shared_state.clone(),
        persist.clone(),
        mqtt_conn,
        mqtt_client.clone(),
    )?;
    spawn_control_loop(shared_state, persist, mqtt_client, runtime.clock_speed_ms)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _sntp = sntp;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn build_sensor(config: &SensorConfig) -> anyhow::Result<TemperatureSensor> {
    let raw: Box<dyn RawSensor> = match config.kind {
        SensorKind::Dht11 | SensorKind::Dht22 => {
            info!("{:?} sensor on GPIO{}", config.kind, config.pin);
            Box::new(DhtSensor::new(config.kind, config.pin)?)
        }
        SensorKind::Emulated => Box::new(EmulatedSensor::new(config.emulator)),
        SensorKind::Remote => {
            warn!("remote sensor feed is host-only, using the emulator");
            Box::new(EmulatedSensor::new(config.emulator))
        }
    };
    Ok(TemperatureSensor::new(config, raw))
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi credentials missing from runtime config"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut attempt = 1;
    loop {
        let result = wifi.connect().and_then(|()| wifi.wait_netif_up());
        match result {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                break;
            }
            Err(err) if attempt < WIFI_CONNECT_ATTEMPTS => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
                attempt += 1;
            }
            Err(err) => {
                return Err(err).context(format!(
                    "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed"
                ));
            }
        }
    }

    Ok(esp_wifi)
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("climate-controller"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Arc<Mutex<EspMqttClient<'static>>>) -> anyhow::Result<()> {
    let topics = [TOPIC_CMD_TARGET, TOPIC_CMD_MODE, TOPIC_CMD_ENERGY_MODE];

    let mut mqtt = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
    }

    Ok(())
}

fn spawn_mqtt_receiver(
    state: SharedState,
    persist: SyncSender<()>,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    if let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }

                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }

                        if let Ok(message) = core::str::from_utf8(data) {
                            if let Err(err) =
                                handle_mqtt_message(&state, &persist, topic, message.trim())
                            {
                                warn!("mqtt message handling failed: {err:#}");
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_topics(&mqtt) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn handle_mqtt_message(
    state: &SharedState,
    persist: &SyncSender<()>,
    topic: &str,
    message: &str,
) -> anyhow::Result<()> {
    let now_ms = epoch_ms(now_in_timezone(&state.timezone));

    let changed = match topic {
        TOPIC_CMD_TARGET => message
            .parse::<f32>()
            .map(|target| state.controller().set_target(target))
            .unwrap_or(false),
        TOPIC_CMD_MODE => ThermostatMode::parse(message)
            .map(|mode| state.controller().set_mode(mode, now_ms))
            .unwrap_or(false),
        TOPIC_CMD_ENERGY_MODE => EnergyMode::parse(message)
            .map(|energy_mode| state.controller().set_energy_mode(energy_mode))
            .unwrap_or(false),
        _ => false,
    };

    if changed {
        request_persist(persist)?;
    }
    Ok(())
}

fn spawn_control_loop(
    state: SharedState,
    persist: SyncSender<()>,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    clock_speed_ms: u64,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            let now = now_in_timezone(&state.timezone);
            let (events, payload) = {
                let mut controller = state.controller();
                let events = controller.tick(now);
                let payload = serde_json::to_vec(&controller.snapshot(epoch_ms(now)));
                (events, payload)
            };

            match payload {
                Ok(payload) => {
                    let mut client = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Err(err) =
                        client.publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, &payload)
                    {
                        warn!("state publish failed: {err:?}");
                    }
                }
                Err(err) => warn!("failed to encode controller snapshot: {err}"),
            }

            if events.iter().any(ControllerEvent::requires_persist) {
                if let Err(err) = request_persist(&persist) {
                    warn!("{err:#}");
                }
            }

            thread::sleep(Duration::from_millis(clock_speed_ms));
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

/// NVS writes run on their own thread so flash latency never delays a tick.
/// A request made while one is already queued folds into it, since every
/// persist exports the controller's latest state.
fn spawn_persister(state: SharedState, nvs_store: NvsStore) -> anyhow::Result<SyncSender<()>> {
    let (tx, rx) = mpsc::sync_channel::<()>(1);
    thread::Builder::new()
        .name("persist".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            for () in rx {
                if let Err(err) = nvs_store.persist(&state) {
                    warn!("failed to persist runtime config: {err:#}");
                }
            }
        })
        .context("failed to spawn persist thread")?;
    Ok(tx)
}

fn request_persist(persist: &SyncSender<()>) -> anyhow::Result<()> {
    match persist.try_send(()) {
        Ok(()) | Err(TrySendError::Full(())) => Ok(()),
        Err(TrySendError::Disconnected(())) => Err(anyhow!("persist thread has stopped")),
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read()
    }

    /// Holds the store lock from load to save.
    fn persist(&self, state: &SharedState) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut runtime = self.read().unwrap_or_default();
        state.controller().export_into(&mut runtime);
        self.write(&runtime)
    }

    fn read(&self) -> anyhow::Result<RuntimeConfig> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_BYTES];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn write(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

fn now_in_timezone(timezone: &str) -> DateTime<FixedOffset> {
    match timezone.parse::<Tz>() {
        Ok(tz) => {
            let local = Utc::now().with_timezone(&tz);
            local.with_timezone(&local.offset().fix())
        }
        Err(_) => Utc::now().fixed_offset(),
    }
}

fn epoch_ms(now: DateTime<FixedOffset>) -> u64 {
    now.timestamp_millis().try_into().unwrap_or_default()
}
