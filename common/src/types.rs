use serde::{Deserialize, Serialize};

use crate::{
    hvac::{PendingTransition, StateTimes},
    routine::Routine,
    schedule::ScheduleItem,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EquipmentState {
    Idle,
    Circulate,
    Cool,
    Heat,
    HeatAux,
}

impl EquipmentState {
    pub const ALL: [Self; 5] = [
        Self::Idle,
        Self::Circulate,
        Self::Cool,
        Self::Heat,
        Self::HeatAux,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Circulate => "CIRCULATE",
            Self::Cool => "COOL",
            Self::Heat => "HEAT",
            Self::HeatAux => "HEAT_AUX",
        }
    }

    pub fn is_idle(self) -> bool {
        self == Self::Idle
    }
}

/// `Auto` lets the controller pick the equipment state; every other mode
/// pins the equipment to the matching state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThermostatMode {
    Auto,
    Idle,
    Circulate,
    Cool,
    Heat,
    HeatAux,
}

impl ThermostatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Idle => "IDLE",
            Self::Circulate => "CIRCULATE",
            Self::Cool => "COOL",
            Self::Heat => "HEAT",
            Self::HeatAux => "HEAT_AUX",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "AUTO" => Some(Self::Auto),
            "IDLE" | "OFF" => Some(Self::Idle),
            "CIRCULATE" | "FAN" => Some(Self::Circulate),
            "COOL" => Some(Self::Cool),
            "HEAT" => Some(Self::Heat),
            "HEAT_AUX" => Some(Self::HeatAux),
            _ => None,
        }
    }

    pub fn forced_state(self) -> Option<EquipmentState> {
        match self {
            Self::Auto => None,
            Self::Idle => Some(EquipmentState::Idle),
            Self::Circulate => Some(EquipmentState::Circulate),
            Self::Cool => Some(EquipmentState::Cool),
            Self::Heat => Some(EquipmentState::Heat),
            Self::HeatAux => Some(EquipmentState::HeatAux),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyMode {
    Away,
    Eco,
    Normal,
}

impl EnergyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Away => "away",
            Self::Eco => "eco",
            Self::Normal => "normal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "away" => Some(Self::Away),
            "eco" => Some(Self::Eco),
            "normal" => Some(Self::Normal),
            _ => None,
        }
    }
}

/// One value per energy mode.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerEnergyMode<T> {
    pub away: T,
    pub eco: T,
    pub normal: T,
}

impl<T> PerEnergyMode<T> {
    pub fn get(&self, mode: EnergyMode) -> &T {
        match mode {
            EnergyMode::Away => &self.away,
            EnergyMode::Eco => &self.eco,
            EnergyMode::Normal => &self.normal,
        }
    }

    pub fn get_mut(&mut self, mode: EnergyMode) -> &mut T {
        match mode {
            EnergyMode::Away => &mut self.away,
            EnergyMode::Eco => &mut self.eco,
            EnergyMode::Normal => &mut self.normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComponentStatus {
    #[serde(rename = "lastActiveMs")]
    pub last_active_ms: u64,
    #[serde(rename = "lastInactiveMs")]
    pub last_inactive_ms: u64,
    #[serde(rename = "isActive")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComponentStates {
    pub compressor: ComponentStatus,
    #[serde(rename = "heatPump")]
    pub heat_pump: ComponentStatus,
    #[serde(rename = "auxHeat")]
    pub aux_heat: ComponentStatus,
    pub fan: ComponentStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HvacSnapshot {
    pub state: EquipmentState,
    #[serde(rename = "nextAction")]
    pub next_action: Option<PendingTransition>,
    pub times: StateTimes,
    pub components: ComponentStates,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub temperature: f32,
    pub humidity: f32,
    pub speed: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThermostatSnapshot {
    pub target: f32,
    pub mode: ThermostatMode,
    #[serde(rename = "energyMode")]
    pub energy_mode: EnergyMode,
    #[serde(rename = "idleSpeed")]
    pub idle_speed: f32,
    #[serde(rename = "currentSpeed")]
    pub current_speed: f32,
    #[serde(rename = "speedStable")]
    pub speed_stable: bool,
    #[serde(rename = "preferredAction")]
    pub preferred_action: Option<EquipmentState>,
    pub schedule: Vec<ScheduleItem>,
    pub routines: Vec<Routine>,
}

/// Update notification published after every tick.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    #[serde(rename = "atMs")]
    pub at_ms: u64,
    pub thermostat: ThermostatSnapshot,
    pub hvac: HvacSnapshot,
    pub sensor: SensorSnapshot,
}
