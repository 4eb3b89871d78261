pub mod config;
pub mod hvac;
pub mod output;
pub mod patch;
pub mod routine;
pub mod schedule;
pub mod sensor;
pub mod thermostat;
pub mod topics;
pub mod types;

pub use config::{
    ConfigError, PersistedSettings, RuntimeConfig, SensorKind, ThermostatPreferences,
};
pub use hvac::{Hvac, HvacRelays, PendingTransition, StateTimes};
pub use output::{DigitalOutput, EmulatedOutput, OutputError};
pub use patch::{PreferencesPatch, SettingsPatch};
pub use routine::{Routine, Routines, TimeOfDay};
pub use schedule::{Schedule, ScheduleItem, ScheduleSelector};
pub use sensor::{
    EmulatedSensor, RawReading, RawSensor, SensorError, SensorReading, TemperatureSensor,
};
pub use thermostat::{ControllerEvent, ThermostatController};
pub use topics::*;
pub use types::{ControllerSnapshot, EnergyMode, EquipmentState, ThermostatMode};
