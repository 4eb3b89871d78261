use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::types::EnergyMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
    #[serde(default)]
    pub second: u8,
}

impl TimeOfDay {
    pub fn is_valid(&self) -> bool {
        self.as_naive().is_some()
    }

    pub fn as_naive(&self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(
            u32::from(self.hour),
            u32::from(self.minute),
            u32::from(self.second),
        )
    }
}

fn default_active() -> bool {
    true
}

/// Daily override of the target and/or energy mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    #[serde(default)]
    pub target: Option<f32>,
    #[serde(default, rename = "energyMode")]
    pub energy_mode: Option<EnergyMode>,
    #[serde(rename = "timeOfDay")]
    pub time_of_day: TimeOfDay,
    #[serde(default, rename = "lastActivated")]
    pub last_activated: Option<NaiveDate>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Routine {
    /// Due once the local time has passed `time_of_day`, unless it already
    /// fired today.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        if !self.active || self.last_activated == Some(now.date()) {
            return false;
        }
        self.time_of_day
            .as_naive()
            .is_some_and(|fire_at| now.time() > fire_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Routines {
    items: Vec<Routine>,
}

impl Routines {
    pub fn new(items: Vec<Routine>) -> Self {
        Self { items }
    }

    pub fn set(&mut self, items: Vec<Routine>) {
        self.items = items;
    }

    pub fn list(&self) -> &[Routine] {
        &self.items
    }

    /// Index of the first routine that should fire now.
    pub fn due(&self, now: NaiveDateTime) -> Option<usize> {
        self.items.iter().position(|routine| routine.is_due(now))
    }

    /// Marks the routine as fired on `today` and returns it.
    pub fn activate(&mut self, index: usize, today: NaiveDate) -> Option<&Routine> {
        let routine = self.items.get_mut(index)?;
        routine.last_activated = Some(today);
        Some(routine)
    }
}
