use chrono::{DateTime, FixedOffset};
use tracing::info;

use crate::{
    config::{
        is_valid_target, validate_routines, ConfigError, PersistedSettings, RuntimeConfig,
        ThermostatPreferences,
    },
    hvac::{Hvac, PendingTransition},
    patch::{PreferencesPatch, SettingsPatch},
    routine::{Routine, Routines},
    schedule::{Schedule, ScheduleItem, ScheduleSelector},
    sensor::{AverageState, TemperatureSensor},
    types::{ControllerSnapshot, EnergyMode, EquipmentState, ThermostatMode, ThermostatSnapshot},
};

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    SensorSampled(AverageState),
    EquipmentQueued(PendingTransition),
    EquipmentChanged {
        from: EquipmentState,
        to: EquipmentState,
    },
    ScheduleApplied(ScheduleItem),
    RoutineApplied {
        index: usize,
        target: Option<f32>,
        energy_mode: Option<EnergyMode>,
    },
}

impl ControllerEvent {
    /// Events that changed state the driver keeps on disk.
    pub fn requires_persist(&self) -> bool {
        matches!(
            self,
            Self::EquipmentChanged { .. } | Self::ScheduleApplied(_) | Self::RoutineApplied { .. }
        )
    }
}

/// The decision engine. Owns the sensor averager and the equipment machine
/// and is advanced by an external driver through [`ThermostatController::tick`].
#[derive(Debug)]
pub struct ThermostatController {
    preferences: ThermostatPreferences,
    settings: PersistedSettings,
    schedule: Schedule,
    routines: Routines,
    sensor: TemperatureSensor,
    hvac: Hvac,
    idle_speed: f32,
    current_speed: f32,
}

impl ThermostatController {
    pub fn new(
        config: &RuntimeConfig,
        sensor: TemperatureSensor,
        hvac: Hvac,
        now_ms: u64,
    ) -> Self {
        let mut settings = config.settings.clone();
        settings.sanitize();
        Self {
            preferences: config.preferences.clone(),
            settings,
            schedule: Schedule::new(config.schedule.clone(), now_ms),
            routines: Routines::new(config.routines.clone()),
            sensor,
            hvac,
            idle_speed: 0.0,
            current_speed: 0.0,
        }
    }

    pub fn target(&self) -> f32 {
        self.settings.target
    }

    pub fn mode(&self) -> ThermostatMode {
        self.settings.mode
    }

    pub fn energy_mode(&self) -> EnergyMode {
        self.settings.energy_mode
    }

    pub fn settings(&self) -> &PersistedSettings {
        &self.settings
    }

    pub fn preferences(&self) -> &ThermostatPreferences {
        &self.preferences
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn routines(&self) -> &[Routine] {
        self.routines.list()
    }

    pub fn sensor(&self) -> &TemperatureSensor {
        &self.sensor
    }

    pub fn hvac(&self) -> &Hvac {
        &self.hvac
    }

    pub fn idle_speed(&self) -> f32 {
        self.idle_speed
    }

    pub fn current_speed(&self) -> f32 {
        self.current_speed
    }

    /// Out-of-range targets are ignored.
    pub fn set_target(&mut self, target: f32) -> bool {
        if !is_valid_target(target) || self.settings.target == target {
            return false;
        }
        info!(from = self.settings.target, to = target, "target changed");
        self.settings.target = target;
        true
    }

    /// A forced mode queues its equipment state right away.
    pub fn set_mode(&mut self, mode: ThermostatMode, now_ms: u64) -> bool {
        let changed = self.settings.mode != mode;
        if changed {
            info!(from = self.settings.mode.as_str(), to = mode.as_str(), "mode changed");
            self.settings.mode = mode;
        }
        if let Some(state) = mode.forced_state() {
            self.hvac.queue(state, now_ms);
        }
        changed
    }

    pub fn set_energy_mode(&mut self, energy_mode: EnergyMode) -> bool {
        if self.settings.energy_mode == energy_mode {
            return false;
        }
        info!(
            from = self.settings.energy_mode.as_str(),
            to = energy_mode.as_str(),
            "energy mode changed"
        );
        self.settings.energy_mode = energy_mode;
        true
    }

    pub fn apply_settings(&mut self, patch: SettingsPatch, now_ms: u64) -> bool {
        let mut changed = false;
        if let Some(target) = patch.target {
            changed |= self.set_target(target);
        }
        if let Some(energy_mode) = patch.energy_mode {
            changed |= self.set_energy_mode(energy_mode);
        }
        if let Some(mode) = patch.mode {
            changed |= self.set_mode(mode, now_ms);
        }
        changed
    }

    pub fn apply_preferences(&mut self, patch: &PreferencesPatch) -> Result<(), ConfigError> {
        patch.apply(&mut self.preferences)
    }

    pub fn set_schedule(&mut self, items: Vec<ScheduleItem>, now_ms: u64) {
        self.schedule.set(items, now_ms);
    }

    pub fn add_schedule(&mut self, items: Vec<ScheduleItem>, now_ms: u64) -> usize {
        self.schedule.add(items, now_ms)
    }

    pub fn remove_schedule(&mut self, selectors: &[ScheduleSelector]) -> usize {
        self.schedule.remove(selectors)
    }

    pub fn set_routines(&mut self, routines: Vec<Routine>) -> Result<(), ConfigError> {
        validate_routines(&routines)?;
        self.routines.set(routines);
        Ok(())
    }

    /// True once the current equipment state has settled long enough for the
    /// speed estimate to be trusted.
    pub fn is_speed_stable(&self, now_ms: u64) -> bool {
        let timing = self.hvac.times().get(self.hvac.state());
        let last_change = timing.last_active_ms.max(timing.last_inactive_ms);
        now_ms > last_change.saturating_add(self.preferences.delay_speed_calculation_ms)
    }

    /// Equipment state the auto policy wants, if any.
    pub fn preferred_action(&self, now_ms: u64) -> Option<EquipmentState> {
        let state = self.hvac.state();
        let times = self.hvac.times();

        if !state.is_idle()
            && now_ms.saturating_sub(times.get(state).last_active_ms)
                > self.preferences.max_runtime_ms
        {
            return Some(EquipmentState::Idle);
        }

        if !self.is_speed_stable(now_ms) {
            return None;
        }

        let energy_mode = self.settings.energy_mode;
        let temp = self.sensor.average().temperature;
        let target = self.settings.target;
        let padding = self.preferences.target_padding(energy_mode);
        let reach = self.preferences.target_reach_offset;
        let aux = self.preferences.aux_heat(energy_mode);
        let circulate = self.preferences.circulate(energy_mode);

        if state.is_idle() {
            if temp < target - padding {
                let cold_start = aux
                    .and_then(|aux| aux.below_temp_from_target)
                    .is_some_and(|below| target - temp >= below);
                return Some(if cold_start {
                    EquipmentState::HeatAux
                } else {
                    EquipmentState::Heat
                });
            }
            if temp > target + padding {
                return Some(EquipmentState::Cool);
            }
            let idle_for = now_ms.saturating_sub(times.idle.last_active_ms);
            return circulate
                .filter(|circulate| idle_for > circulate.every_ms)
                .map(|_| EquipmentState::Circulate);
        }

        let heating_slowly = aux
            .and_then(|aux| aux.below_speed)
            .is_some_and(|below| self.current_speed < below);

        match state {
            EquipmentState::Heat if heating_slowly => Some(EquipmentState::HeatAux),
            EquipmentState::Circulate => {
                let circulating_for = now_ms.saturating_sub(times.circulate.last_active_ms);
                // Circulation disabled for this energy mode ends right away.
                circulate
                    .map_or(true, |circulate| circulating_for > circulate.for_ms)
                    .then_some(EquipmentState::Idle)
            }
            EquipmentState::Heat | EquipmentState::HeatAux if temp >= target + reach => {
                Some(EquipmentState::Idle)
            }
            EquipmentState::Cool if temp <= target - reach => Some(EquipmentState::Idle),
            _ => None,
        }
    }

    /// One control step: sample, clock the equipment, apply due overrides,
    /// then queue the wanted equipment state.
    pub fn tick(&mut self, now: DateTime<FixedOffset>) -> Vec<ControllerEvent> {
        let now_ms = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        let mut events = Vec::new();

        let average = self.sensor.clock(now_ms);
        events.push(ControllerEvent::SensorSampled(average));

        let before = self.hvac.state();
        if self.hvac.clock(now_ms) {
            events.push(ControllerEvent::EquipmentChanged {
                from: before,
                to: self.hvac.state(),
            });
            if let Some(pending) = self.hvac.pending() {
                events.push(ControllerEvent::EquipmentQueued(*pending));
            }
        }

        if self.is_speed_stable(now_ms) {
            if self.hvac.state().is_idle() {
                self.idle_speed = average.speed;
            }
            self.current_speed = average.speed;
        }

        if let Some(item) = self.schedule.take_due(now_ms) {
            info!(target = item.target, "schedule item applied");
            self.set_target(item.target);
            events.push(ControllerEvent::ScheduleApplied(item));
        }

        let local = now.naive_local();
        if let Some(index) = self.routines.due(local) {
            if let Some(routine) = self.routines.activate(index, local.date()).cloned() {
                info!(index, "routine applied");
                if let Some(target) = routine.target {
                    self.set_target(target);
                }
                if let Some(energy_mode) = routine.energy_mode {
                    self.set_energy_mode(energy_mode);
                }
                events.push(ControllerEvent::RoutineApplied {
                    index,
                    target: routine.target,
                    energy_mode: routine.energy_mode,
                });
            }
        }

        let wanted = match self.settings.mode.forced_state() {
            None => self.preferred_action(now_ms),
            Some(state) => (self.hvac.state() != state).then_some(state),
        };
        if let Some(state) = wanted {
            if self.hvac.queue(state, now_ms) {
                if let Some(pending) = self.hvac.pending() {
                    events.push(ControllerEvent::EquipmentQueued(*pending));
                }
            }
        }

        events
    }

    pub fn snapshot(&self, now_ms: u64) -> ControllerSnapshot {
        ControllerSnapshot {
            at_ms: now_ms,
            thermostat: ThermostatSnapshot {
                target: self.settings.target,
                mode: self.settings.mode,
                energy_mode: self.settings.energy_mode,
                idle_speed: self.idle_speed,
                current_speed: self.current_speed,
                speed_stable: self.is_speed_stable(now_ms),
                preferred_action: self.preferred_action(now_ms),
                schedule: self.schedule.list().to_vec(),
                routines: self.routines.list().to_vec(),
            },
            hvac: self.hvac.snapshot(),
            sensor: self.sensor.snapshot(),
        }
    }

    /// Copies every persisted piece of state back into `config`.
    pub fn export_into(&self, config: &mut RuntimeConfig) {
        config.settings = self.settings.clone();
        config.preferences = self.preferences.clone();
        config.schedule = self.schedule.list().to_vec();
        config.routines = self.routines.list().to_vec();
        config.times = *self.hvac.times();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AuxHeatPreferences,
        hvac::{HvacRelays, StateTimes},
        routine::TimeOfDay,
        sensor::{RawReading, RawSensor, SensorError},
    };
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    const MINUTE_MS: u64 = 60_000;

    fn fixed_time(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::west_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    fn ms(time: DateTime<FixedOffset>) -> u64 {
        time.timestamp_millis() as u64
    }

    fn plus_minutes(time: DateTime<FixedOffset>, minutes: i64) -> DateTime<FixedOffset> {
        time + chrono::Duration::minutes(minutes)
    }

    /// Raw sensor whose temperature the test can move.
    #[derive(Clone)]
    struct Thermometer(Arc<Mutex<f32>>);

    impl Thermometer {
        fn set(&self, temperature: f32) {
            *self.0.lock().unwrap() = temperature;
        }
    }

    impl RawSensor for Thermometer {
        fn read(&mut self) -> Result<RawReading, SensorError> {
            Ok(RawReading {
                temperature: *self.0.lock().unwrap(),
                humidity: 45.0,
            })
        }
    }

    fn test_config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.sensor.precision = 1;
        config.routines.clear();
        config
    }

    fn build(
        config: &RuntimeConfig,
        temp: f32,
        now_ms: u64,
    ) -> (ThermostatController, Thermometer) {
        let thermometer = Thermometer(Arc::new(Mutex::new(temp)));
        let sensor = TemperatureSensor::new(&config.sensor, Box::new(thermometer.clone()));
        let hvac = Hvac::new(
            &config.hvac,
            HvacRelays::emulated(&config.hvac),
            StateTimes::default(),
            now_ms,
        );
        (
            ThermostatController::new(config, sensor, hvac, now_ms),
            thermometer,
        )
    }

    /// Controller at 70 with a sampled temperature of `temp`.
    fn sampled(temp: f32, now_ms: u64) -> ThermostatController {
        let (mut controller, _) = build(&test_config(), temp, now_ms);
        controller.sensor.clock(now_ms);
        controller
    }

    /// Puts the equipment into `state` at `now_ms`.
    fn force_state(controller: &mut ThermostatController, state: EquipmentState, now_ms: u64) {
        controller.hvac.queue(state, now_ms);
        let due = controller.hvac.pending().unwrap().due_ms;
        assert!(controller.hvac.clock(due));
        assert_eq!(controller.hvac.state(), state);
    }

    #[test]
    fn no_preference_while_speed_unstable() {
        let t0 = ms(fixed_time(5, 8, 0));
        for temp in [40.0, 70.0, 95.0] {
            let controller = sampled(temp, t0);
            assert!(!controller.is_speed_stable(t0 + 15 * MINUTE_MS));
            assert_eq!(controller.preferred_action(t0 + 15 * MINUTE_MS), None);
        }
    }

    #[test]
    fn idle_heats_then_holds_then_circulates() {
        let t0 = ms(fixed_time(5, 8, 0));
        let stable = t0 + 16 * MINUTE_MS;

        let mut controller = sampled(68.0, t0);
        assert_eq!(controller.preferred_action(stable), Some(EquipmentState::Heat));

        controller = sampled(69.5, t0);
        assert_eq!(controller.preferred_action(stable), None);
        assert_eq!(
            controller.preferred_action(t0 + 61 * MINUTE_MS),
            Some(EquipmentState::Circulate)
        );
    }

    #[test]
    fn idle_cools_above_band() {
        let t0 = ms(fixed_time(5, 8, 0));
        let controller = sampled(71.5, t0);

        assert_eq!(
            controller.preferred_action(t0 + 16 * MINUTE_MS),
            Some(EquipmentState::Cool)
        );
    }

    #[test]
    fn cold_start_escalates_to_aux_heat() {
        let t0 = ms(fixed_time(5, 8, 0));
        let controller = sampled(60.0, t0);

        assert_eq!(
            controller.preferred_action(t0 + 16 * MINUTE_MS),
            Some(EquipmentState::HeatAux)
        );
    }

    #[test]
    fn cold_start_without_aux_thresholds_heats() {
        let t0 = ms(fixed_time(5, 8, 0));
        let mut controller = sampled(60.0, t0);
        controller.settings.energy_mode = EnergyMode::Eco;

        assert_eq!(
            controller.preferred_action(t0 + 16 * MINUTE_MS),
            Some(EquipmentState::Heat)
        );
    }

    #[test]
    fn slow_heat_escalates_to_aux() {
        let t0 = ms(fixed_time(5, 8, 0));
        let mut controller = sampled(67.0, t0);
        force_state(&mut controller, EquipmentState::Heat, t0);
        let heat_at = controller.hvac.times().heat.last_active_ms;
        let stable = heat_at + 16 * MINUTE_MS;

        controller.current_speed = 0.1;
        assert_eq!(
            controller.preferred_action(stable),
            Some(EquipmentState::HeatAux)
        );

        controller.current_speed = 0.5;
        assert_eq!(controller.preferred_action(stable), None);
    }

    #[test]
    fn aux_speed_threshold_can_be_disabled() {
        let t0 = ms(fixed_time(5, 8, 0));
        let mut controller = sampled(67.0, t0);
        controller.preferences.aux_heat.normal = Some(AuxHeatPreferences {
            below_speed: None,
            below_temp_from_target: Some(10.0),
        });
        force_state(&mut controller, EquipmentState::Heat, t0);
        controller.current_speed = -2.0;

        let stable = controller.hvac.times().heat.last_active_ms + 16 * MINUTE_MS;
        assert_eq!(controller.preferred_action(stable), None);
    }

    #[test]
    fn heating_stops_once_target_reached() {
        let t0 = ms(fixed_time(5, 8, 0));
        for state in [EquipmentState::Heat, EquipmentState::HeatAux] {
            let mut controller = sampled(70.5, t0);
            controller.current_speed = 1.0;
            force_state(&mut controller, state, t0);
            let stable = controller.hvac.times().get(state).last_active_ms + 16 * MINUTE_MS;

            assert_eq!(
                controller.preferred_action(stable),
                Some(EquipmentState::Idle),
                "{state:?}"
            );
        }
    }

    #[test]
    fn cooling_stops_once_target_reached() {
        let t0 = ms(fixed_time(5, 8, 0));
        let mut controller = sampled(69.7, t0);
        force_state(&mut controller, EquipmentState::Cool, t0);
        let stable = controller.hvac.times().cool.last_active_ms + 16 * MINUTE_MS;
        assert_eq!(controller.preferred_action(stable), None);

        let mut controller = sampled(69.5, t0);
        force_state(&mut controller, EquipmentState::Cool, t0);
        assert_eq!(
            controller.preferred_action(stable),
            Some(EquipmentState::Idle)
        );
    }

    #[test]
    fn circulation_ends_after_its_duration() {
        let t0 = ms(fixed_time(5, 8, 0));
        let mut controller = sampled(70.0, t0);
        force_state(&mut controller, EquipmentState::Circulate, t0);
        let started = controller.hvac.times().circulate.last_active_ms;

        assert_eq!(controller.preferred_action(started + 17 * MINUTE_MS), None);
        assert_eq!(
            controller.preferred_action(started + 21 * MINUTE_MS),
            Some(EquipmentState::Idle)
        );
    }

    #[test]
    fn max_runtime_forces_idle() {
        let t0 = ms(fixed_time(5, 8, 0));
        let mut controller = sampled(80.0, t0);
        force_state(&mut controller, EquipmentState::Cool, t0);
        let started = controller.hvac.times().cool.last_active_ms;

        assert_eq!(controller.preferred_action(started + 2 * 60 * MINUTE_MS), None);
        assert_eq!(
            controller.preferred_action(started + 2 * 60 * MINUTE_MS + 1),
            Some(EquipmentState::Idle)
        );
    }

    #[test]
    fn out_of_range_targets_are_ignored() {
        let (mut controller, _) = build(&test_config(), 70.0, 0);

        assert!(!controller.set_target(50.0));
        assert!(!controller.set_target(90.0));
        assert!(!controller.set_target(f32::INFINITY));
        assert_eq!(controller.target(), 70.0);

        assert!(controller.set_target(72.5));
        assert!(!controller.set_target(72.5));
        assert_eq!(controller.target(), 72.5);
    }

    #[test]
    fn forced_mode_queues_its_state() {
        let start = fixed_time(5, 8, 0);
        let (mut controller, _) = build(&test_config(), 70.0, ms(start));

        assert!(controller.set_mode(ThermostatMode::Cool, ms(start)));
        let pending = *controller.hvac().pending().unwrap();
        assert_eq!(pending.target, EquipmentState::Cool);

        let events = controller.tick(plus_minutes(start, 11));
        assert_eq!(controller.hvac().state(), EquipmentState::Cool);
        assert!(events.contains(&ControllerEvent::EquipmentChanged {
            from: EquipmentState::Idle,
            to: EquipmentState::Cool,
        }));

        // A forced mode ignores the auto policy, even far past max runtime.
        controller.tick(plus_minutes(start, 200));
        assert_eq!(controller.hvac().state(), EquipmentState::Cool);
        assert_eq!(controller.hvac().pending(), None);
    }

    #[test]
    fn settings_patch_skips_bad_target_but_applies_the_rest() {
        let start = fixed_time(5, 8, 0);
        let (mut controller, _) = build(&test_config(), 70.0, ms(start));

        let patch = SettingsPatch {
            target: Some(95.0),
            mode: Some(ThermostatMode::Heat),
            energy_mode: Some(EnergyMode::Eco),
        };
        assert!(controller.apply_settings(patch, ms(start)));

        assert_eq!(controller.target(), 70.0);
        assert_eq!(controller.energy_mode(), EnergyMode::Eco);
        assert_eq!(controller.mode(), ThermostatMode::Heat);
        let pending = *controller.hvac().pending().unwrap();
        assert_eq!(pending.target, EquipmentState::Heat);

        assert!(!controller.apply_settings(patch, ms(start)));
        assert!(!controller.apply_settings(SettingsPatch::default(), ms(start)));
    }

    #[test]
    fn auto_tick_heats_after_idle_dwell() {
        let start = fixed_time(5, 8, 0);
        let mut config = test_config();
        // no aux heat thresholds in eco
        config.settings.energy_mode = EnergyMode::Eco;
        let (mut controller, thermometer) = build(&config, 66.0, ms(start));

        let events = controller.tick(plus_minutes(start, 5));
        assert!(!events
            .iter()
            .any(|event| matches!(event, ControllerEvent::EquipmentQueued(_))));

        let events = controller.tick(plus_minutes(start, 16));
        assert!(events.iter().any(|event| matches!(
            event,
            ControllerEvent::EquipmentQueued(PendingTransition {
                target: EquipmentState::Heat,
                ..
            })
        )));

        let events = controller.tick(plus_minutes(start, 17));
        assert_eq!(controller.hvac().state(), EquipmentState::Heat);
        assert!(events.iter().any(ControllerEvent::requires_persist));

        thermometer.set(70.5);
        controller.tick(plus_minutes(start, 40));
        controller.tick(plus_minutes(start, 41));
        assert_eq!(controller.hvac().state(), EquipmentState::Idle);
    }

    #[test]
    fn speeds_are_recorded_only_when_stable() {
        let start = fixed_time(5, 8, 0);
        let (mut controller, thermometer) = build(&test_config(), 70.0, ms(start));

        controller.tick(plus_minutes(start, 1));
        thermometer.set(70.5);
        controller.tick(plus_minutes(start, 2));
        assert_eq!(controller.current_speed(), 0.0);

        controller.tick(plus_minutes(start, 20));
        thermometer.set(70.0);
        controller.tick(plus_minutes(start, 21));
        assert!(controller.current_speed() < 0.0);
        assert_eq!(controller.idle_speed(), controller.current_speed());
    }

    #[test]
    fn schedule_applies_before_routine() {
        let start = fixed_time(5, 20, 0);
        let mut config = test_config();
        config.schedule = vec![ScheduleItem {
            target: 74.0,
            time_ms: ms(plus_minutes(start, 30)),
        }];
        config.routines = vec![Routine {
            target: Some(66.0),
            energy_mode: Some(EnergyMode::Eco),
            time_of_day: TimeOfDay {
                hour: 20,
                minute: 15,
                second: 0,
            },
            last_activated: None,
            active: true,
        }];
        let (mut controller, _) = build(&config, 70.0, ms(start));

        let events = controller.tick(plus_minutes(start, 45));

        let applied: Vec<_> = events
            .iter()
            .filter(|event| event.requires_persist())
            .cloned()
            .collect();
        assert_eq!(
            applied,
            vec![
                ControllerEvent::ScheduleApplied(config.schedule[0]),
                ControllerEvent::RoutineApplied {
                    index: 0,
                    target: Some(66.0),
                    energy_mode: Some(EnergyMode::Eco),
                },
            ]
        );
        assert_eq!(controller.target(), 66.0);
        assert_eq!(controller.energy_mode(), EnergyMode::Eco);
        assert!(controller.schedule().is_empty());

        // same day: the routine stays quiet even after the target moves
        controller.set_target(71.0);
        let events = controller.tick(plus_minutes(start, 50));
        assert!(!events
            .iter()
            .any(|event| matches!(event, ControllerEvent::RoutineApplied { .. })));
        assert_eq!(controller.target(), 71.0);
    }

    #[test]
    fn rejects_invalid_routines() {
        let (mut controller, _) = build(&test_config(), 70.0, 0);
        let routine = Routine {
            target: Some(95.0),
            energy_mode: None,
            time_of_day: TimeOfDay {
                hour: 6,
                minute: 0,
                second: 0,
            },
            last_activated: None,
            active: true,
        };

        assert!(controller.set_routines(vec![routine]).is_err());
        assert!(controller.routines().is_empty());
    }

    #[test]
    fn snapshot_serialises_camel_case() {
        let t0 = ms(fixed_time(5, 8, 0));
        let controller = sampled(68.0, t0);
        let json = serde_json::to_value(controller.snapshot(t0)).unwrap();

        assert_eq!(json["thermostat"]["energyMode"], "normal");
        assert_eq!(json["thermostat"]["mode"], "AUTO");
        assert_eq!(json["hvac"]["state"], "IDLE");
        assert_eq!(json["hvac"]["times"]["IDLE"]["lastActiveMs"], t0);
        assert_eq!(json["hvac"]["components"]["heatPump"]["isActive"], false);
        assert_eq!(json["sensor"]["temperature"], 68.0);
    }

    #[test]
    fn export_round_trips_persisted_state() {
        let t0 = ms(fixed_time(5, 8, 0));
        let mut controller = sampled(68.0, t0);
        controller.set_target(73.0);
        controller.set_energy_mode(EnergyMode::Away);

        let mut config = RuntimeConfig::default();
        controller.export_into(&mut config);

        assert_eq!(config.settings.target, 73.0);
        assert_eq!(config.settings.energy_mode, EnergyMode::Away);
        assert_eq!(config.times.idle.last_active_ms, t0);
        assert!(config.routines.is_empty());
    }
}
