use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    hvac::StateTimes,
    routine::{Routine, TimeOfDay},
    schedule::ScheduleItem,
    types::{EnergyMode, PerEnergyMode, ThermostatMode},
};

/// Targets are accepted only strictly inside this range.
pub const TARGET_LOWER_EXCLUSIVE: f32 = 50.0;
pub const TARGET_UPPER_EXCLUSIVE: f32 = 90.0;
pub const DEFAULT_TARGET: f32 = 70.0;

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

pub fn is_valid_target(target: f32) -> bool {
    target.is_finite() && target > TARGET_LOWER_EXCLUSIVE && target < TARGET_UPPER_EXCLUSIVE
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("wiring pin {pin} is assigned to both {first} and {second}")]
    DuplicatePin {
        pin: i32,
        first: &'static str,
        second: &'static str,
    },
    #[error("wiring pin for {0} must not be negative")]
    NegativePin(&'static str),
    #[error("sensor precision must be at least 1")]
    ZeroPrecision,
    #[error("sensor emulator bounds are inverted or not finite")]
    InvalidEmulatorBounds,
    #[error("clock speed must be greater than zero")]
    ZeroClockSpeed,
    #[error("{field} must be a finite, non-negative number (got {value})")]
    InvalidNumber { field: &'static str, value: f32 },
    #[error("circulation for {0} mode needs non-zero durations")]
    ZeroCirculation(&'static str),
    #[error("routine {index} has an invalid time of day")]
    InvalidRoutineTime { index: usize },
    #[error("routine {index} has an out-of-range target {target}")]
    InvalidRoutineTarget { index: usize, target: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HvacWiring {
    pub compressor: i32,
    pub heat_pump: i32,
    pub aux_heat: i32,
    pub fan: i32,
}

impl Default for HvacWiring {
    fn default() -> Self {
        Self {
            compressor: 1,
            heat_pump: 3,
            aux_heat: 4,
            fan: 2,
        }
    }
}

impl HvacWiring {
    pub fn pins(&self) -> [(&'static str, i32); 4] {
        [
            ("compressor", self.compressor),
            ("heat_pump", self.heat_pump),
            ("aux_heat", self.aux_heat),
            ("fan", self.fan),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pins = self.pins();
        for (i, &(name, pin)) in pins.iter().enumerate() {
            if pin < 0 {
                return Err(ConfigError::NegativePin(name));
            }
            if let Some(&(other, _)) = pins[..i].iter().find(|(_, other)| *other == pin) {
                return Err(ConfigError::DuplicatePin {
                    pin,
                    first: other,
                    second: name,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HvacConfig {
    pub min_cycle_ms: u64,
    pub min_idle_ms: u64,
    pub wiring: HvacWiring,
}

impl Default for HvacConfig {
    fn default() -> Self {
        Self {
            min_cycle_ms: 10 * MINUTE_MS,
            min_idle_ms: 10 * MINUTE_MS,
            wiring: HvacWiring::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Emulated,
    Remote,
    Dht11,
    Dht22,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmulatorBounds {
    pub min_temp: f32,
    pub max_temp: f32,
    pub min_humidity: f32,
    pub max_humidity: f32,
}

impl Default for EmulatorBounds {
    fn default() -> Self {
        Self {
            min_temp: 66.0,
            max_temp: 74.0,
            min_humidity: 30.0,
            max_humidity: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub kind: SensorKind,
    pub pin: i32,
    pub temp_offset: f32,
    pub humidity_offset: f32,
    /// Rolling window length.
    pub precision: usize,
    pub initial_temp: f32,
    pub initial_humidity: f32,
    /// Readings older than this are refused by the remote feed.
    pub stale_after_ms: u64,
    #[serde(default)]
    pub emulator: EmulatorBounds,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::Emulated,
            pin: 0,
            temp_offset: 0.0,
            humidity_offset: 0.0,
            precision: 10,
            initial_temp: 72.0,
            initial_humidity: 0.0,
            stale_after_ms: 5 * MINUTE_MS,
            emulator: EmulatorBounds::default(),
        }
    }
}

impl SensorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.precision == 0 {
            return Err(ConfigError::ZeroPrecision);
        }
        let bounds = &self.emulator;
        let finite = [
            bounds.min_temp,
            bounds.max_temp,
            bounds.min_humidity,
            bounds.max_humidity,
        ]
        .iter()
        .all(|value| value.is_finite());
        if !finite || bounds.min_temp > bounds.max_temp || bounds.min_humidity > bounds.max_humidity
        {
            return Err(ConfigError::InvalidEmulatorBounds);
        }
        Ok(())
    }
}

/// Aux heat escalation thresholds. A `None` threshold disables that trigger.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AuxHeatPreferences {
    #[serde(default)]
    pub below_speed: Option<f32>,
    #[serde(default)]
    pub below_temp_from_target: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CirculatePreferences {
    pub for_ms: u64,
    pub every_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermostatPreferences {
    pub target_reach_offset: f32,
    pub delay_speed_calculation_ms: u64,
    pub max_runtime_ms: u64,
    pub target_padding: PerEnergyMode<f32>,
    pub aux_heat: PerEnergyMode<Option<AuxHeatPreferences>>,
    pub circulate: PerEnergyMode<Option<CirculatePreferences>>,
}

impl Default for ThermostatPreferences {
    fn default() -> Self {
        Self {
            target_reach_offset: 0.4,
            delay_speed_calculation_ms: 15 * MINUTE_MS,
            max_runtime_ms: 2 * HOUR_MS,
            target_padding: PerEnergyMode {
                away: 8.0,
                eco: 3.0,
                normal: 1.0,
            },
            aux_heat: PerEnergyMode {
                away: None,
                eco: None,
                normal: Some(AuxHeatPreferences {
                    below_speed: Some(0.3),
                    below_temp_from_target: Some(10.0),
                }),
            },
            circulate: PerEnergyMode {
                away: Some(CirculatePreferences {
                    for_ms: 30 * MINUTE_MS,
                    every_ms: 4 * HOUR_MS,
                }),
                eco: Some(CirculatePreferences {
                    for_ms: 10 * MINUTE_MS,
                    every_ms: HOUR_MS,
                }),
                normal: Some(CirculatePreferences {
                    for_ms: 20 * MINUTE_MS,
                    every_ms: HOUR_MS,
                }),
            },
        }
    }
}

impl ThermostatPreferences {
    pub fn target_padding(&self, mode: EnergyMode) -> f32 {
        *self.target_padding.get(mode)
    }

    pub fn aux_heat(&self, mode: EnergyMode) -> Option<&AuxHeatPreferences> {
        self.aux_heat.get(mode).as_ref()
    }

    pub fn circulate(&self, mode: EnergyMode) -> Option<&CirculatePreferences> {
        self.circulate.get(mode).as_ref()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_number("target_reach_offset", self.target_reach_offset)?;

        for mode in [EnergyMode::Away, EnergyMode::Eco, EnergyMode::Normal] {
            check_number("target_padding", self.target_padding(mode))?;

            if let Some(aux) = self.aux_heat(mode) {
                if let Some(below) = aux.below_temp_from_target {
                    check_number("aux_heat.below_temp_from_target", below)?;
                }
                // Speed thresholds may be negative: a falling temperature while heating.
                if let Some(below) = aux.below_speed {
                    if !below.is_finite() {
                        return Err(ConfigError::InvalidNumber {
                            field: "aux_heat.below_speed",
                            value: below,
                        });
                    }
                }
            }

            if let Some(circulate) = self.circulate(mode) {
                if circulate.for_ms == 0 || circulate.every_ms == 0 {
                    return Err(ConfigError::ZeroCirculation(mode.as_str()));
                }
            }
        }
        Ok(())
    }
}

fn check_number(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidNumber { field, value })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub target: f32,
    pub mode: ThermostatMode,
    pub energy_mode: EnergyMode,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET,
            mode: ThermostatMode::Auto,
            energy_mode: EnergyMode::Normal,
        }
    }
}

impl PersistedSettings {
    pub fn sanitize(&mut self) {
        if !is_valid_target(self.target) {
            self.target = DEFAULT_TARGET;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Station credentials, only used by the esp32 build.
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub hvac: HvacConfig,
    pub sensor: SensorConfig,
    pub preferences: ThermostatPreferences,
    pub settings: PersistedSettings,
    pub clock_speed_ms: u64,
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub schedule: Vec<ScheduleItem>,
    #[serde(default)]
    pub routines: Vec<Routine>,
    #[serde(default)]
    pub times: StateTimes,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            hvac: HvacConfig::default(),
            sensor: SensorConfig::default(),
            preferences: ThermostatPreferences::default(),
            settings: PersistedSettings::default(),
            clock_speed_ms: MINUTE_MS,
            timezone: "America/Los_Angeles".to_string(),
            network: NetworkConfig::default(),
            schedule: Vec::new(),
            routines: vec![Routine {
                target: Some(68.0),
                energy_mode: None,
                time_of_day: TimeOfDay {
                    hour: 21,
                    minute: 0,
                    second: 0,
                },
                last_activated: None,
                active: true,
            }],
            times: StateTimes::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clock_speed_ms == 0 {
            return Err(ConfigError::ZeroClockSpeed);
        }
        self.hvac.wiring.validate()?;
        self.sensor.validate()?;
        self.preferences.validate()?;
        validate_routines(&self.routines)
    }
}

pub fn validate_routines(routines: &[Routine]) -> Result<(), ConfigError> {
    for (index, routine) in routines.iter().enumerate() {
        if !routine.time_of_day.is_valid() {
            return Err(ConfigError::InvalidRoutineTime { index });
        }
        if let Some(target) = routine.target {
            if !is_valid_target(target) {
                return Err(ConfigError::InvalidRoutineTarget { index, target });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(RuntimeConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_shared_wiring_pins() {
        let mut config = RuntimeConfig::default();
        config.hvac.wiring.fan = config.hvac.wiring.compressor;

        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicatePin {
                pin: 1,
                first: "compressor",
                second: "fan",
            })
        );
    }

    #[test]
    fn rejects_zero_precision_and_clock() {
        let mut config = RuntimeConfig::default();
        config.sensor.precision = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroPrecision));

        let mut config = RuntimeConfig::default();
        config.clock_speed_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroClockSpeed));
    }

    #[test]
    fn rejects_negative_padding() {
        let mut config = RuntimeConfig::default();
        config.preferences.target_padding.eco = -1.0;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidNumber {
                field: "target_padding",
                ..
            })
        ));
    }

    #[test]
    fn rejects_zero_length_circulation() {
        let mut config = RuntimeConfig::default();
        config.preferences.circulate.away = Some(CirculatePreferences {
            for_ms: 0,
            every_ms: HOUR_MS,
        });

        assert_eq!(config.validate(), Err(ConfigError::ZeroCirculation("away")));
    }

    #[test]
    fn rejects_routine_with_bad_time() {
        let mut config = RuntimeConfig::default();
        config.routines[0].time_of_day.hour = 24;

        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidRoutineTime { index: 0 })
        );
    }

    #[test]
    fn sanitize_restores_default_target() {
        let mut settings = PersistedSettings {
            target: 95.0,
            ..PersistedSettings::default()
        };
        settings.sanitize();
        assert_eq!(settings.target, DEFAULT_TARGET);

        settings.target = 64.5;
        settings.sanitize();
        assert_eq!(settings.target, 64.5);
    }

    #[test]
    fn target_bounds_are_exclusive() {
        assert!(!is_valid_target(50.0));
        assert!(is_valid_target(50.5));
        assert!(is_valid_target(89.9));
        assert!(!is_valid_target(90.0));
        assert!(!is_valid_target(f32::NAN));
    }

    #[test]
    fn runtime_config_round_trips_through_json() {
        let raw = serde_json::to_string(&RuntimeConfig::default()).unwrap();
        let parsed: RuntimeConfig = serde_json::from_str(&raw).unwrap();

        assert_eq!(parsed.preferences, ThermostatPreferences::default());
        assert_eq!(parsed.routines.len(), 1);
        assert_eq!(parsed.settings.mode, ThermostatMode::Auto);
    }
}
