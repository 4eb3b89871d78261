use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    config::{AuxHeatPreferences, CirculatePreferences, ConfigError, ThermostatPreferences},
    types::{EnergyMode, PerEnergyMode, ThermostatMode},
};

/// Field-level update of a per-energy-mode map. Absent modes are untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct PerEnergyModePatch<T> {
    #[serde(default, deserialize_with = "present")]
    pub away: Option<T>,
    #[serde(default, deserialize_with = "present")]
    pub eco: Option<T>,
    #[serde(default, deserialize_with = "present")]
    pub normal: Option<T>,
}

impl<T> Default for PerEnergyModePatch<T> {
    fn default() -> Self {
        Self {
            away: None,
            eco: None,
            normal: None,
        }
    }
}

/// A present key is `Some`, even when its value is `null`.
fn present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl<T: Clone> PerEnergyModePatch<T> {
    fn merge_into(&self, target: &mut PerEnergyMode<T>) {
        for (mode, value) in [
            (EnergyMode::Away, &self.away),
            (EnergyMode::Eco, &self.eco),
            (EnergyMode::Normal, &self.normal),
        ] {
            if let Some(value) = value {
                *target.get_mut(mode) = value.clone();
            }
        }
    }
}

/// Partial update of [`ThermostatPreferences`]. An aux heat or circulation
/// entry replaces that mode's whole entry; `null` inside it disables it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferencesPatch {
    pub target_reach_offset: Option<f32>,
    pub delay_speed_calculation_ms: Option<u64>,
    pub max_runtime_ms: Option<u64>,
    pub target_padding: PerEnergyModePatch<f32>,
    pub aux_heat: PerEnergyModePatch<Option<AuxHeatPreferences>>,
    pub circulate: PerEnergyModePatch<Option<CirculatePreferences>>,
}

impl PreferencesPatch {
    /// Merges into `preferences`. Nothing is written when the merged result
    /// would be invalid.
    pub fn apply(&self, preferences: &mut ThermostatPreferences) -> Result<(), ConfigError> {
        let mut merged = preferences.clone();
        if let Some(offset) = self.target_reach_offset {
            merged.target_reach_offset = offset;
        }
        if let Some(delay) = self.delay_speed_calculation_ms {
            merged.delay_speed_calculation_ms = delay;
        }
        if let Some(max_runtime) = self.max_runtime_ms {
            merged.max_runtime_ms = max_runtime;
        }
        self.target_padding.merge_into(&mut merged.target_padding);
        self.aux_heat.merge_into(&mut merged.aux_heat);
        self.circulate.merge_into(&mut merged.circulate);

        merged.validate()?;
        *preferences = merged;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub target: Option<f32>,
    pub mode: Option<ThermostatMode>,
    pub energy_mode: Option<EnergyMode>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn merges_only_present_fields() {
        let mut preferences = ThermostatPreferences::default();
        let patch: PreferencesPatch = serde_json::from_str(
            r#"{"target_reach_offset":0.6,"target_padding":{"eco":2.5},"circulate":{"away":null}}"#,
        )
        .unwrap();
        patch.apply(&mut preferences).unwrap();

        let defaults = ThermostatPreferences::default();
        assert_eq!(preferences.target_reach_offset, 0.6);
        assert_eq!(preferences.target_padding(EnergyMode::Eco), 2.5);
        assert_eq!(preferences.target_padding(EnergyMode::Normal), 1.0);
        assert_eq!(preferences.circulate(EnergyMode::Away), None);
        assert_eq!(preferences.circulate.normal, defaults.circulate.normal);
        assert_eq!(preferences.aux_heat, defaults.aux_heat);
        assert_eq!(preferences.max_runtime_ms, defaults.max_runtime_ms);
    }

    #[test]
    fn invalid_merge_leaves_preferences_untouched() {
        let mut preferences = ThermostatPreferences::default();
        let patch = PreferencesPatch {
            target_reach_offset: Some(0.2),
            target_padding: PerEnergyModePatch {
                normal: Some(-1.0),
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(patch.apply(&mut preferences).is_err());
        assert_eq!(preferences, ThermostatPreferences::default());
    }

    #[test]
    fn aux_heat_entry_replaces_whole_mode() {
        let mut preferences = ThermostatPreferences::default();
        let patch = PreferencesPatch {
            aux_heat: PerEnergyModePatch {
                eco: Some(Some(AuxHeatPreferences {
                    below_speed: Some(0.1),
                    below_temp_from_target: None,
                })),
                ..Default::default()
            },
            ..Default::default()
        };
        patch.apply(&mut preferences).unwrap();

        let eco = preferences.aux_heat(EnergyMode::Eco).unwrap();
        assert_eq!(eco.below_speed, Some(0.1));
        assert_eq!(eco.below_temp_from_target, None);
    }

    #[test]
    fn settings_patch_parses_partial_payload() {
        let patch: SettingsPatch = serde_json::from_str(r#"{"energy_mode":"away"}"#).unwrap();

        assert_eq!(
            patch,
            SettingsPatch {
                target: None,
                mode: None,
                energy_mode: Some(EnergyMode::Away),
            }
        );
    }
}
