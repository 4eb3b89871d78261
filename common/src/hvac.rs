use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::HvacConfig,
    output::{DigitalOutput, EmulatedOutput},
    types::{ComponentStates, ComponentStatus, EquipmentState, HvacSnapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransition {
    #[serde(rename = "targetState")]
    pub target: EquipmentState,
    #[serde(rename = "dueAtMs")]
    pub due_ms: u64,
    #[serde(rename = "idleFirst")]
    pub idle_first: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateTiming {
    #[serde(rename = "lastActiveMs")]
    pub last_active_ms: u64,
    #[serde(rename = "lastInactiveMs")]
    pub last_inactive_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct StateTimes {
    pub idle: StateTiming,
    pub circulate: StateTiming,
    pub cool: StateTiming,
    pub heat: StateTiming,
    pub heat_aux: StateTiming,
}

impl StateTimes {
    pub fn get(&self, state: EquipmentState) -> &StateTiming {
        match state {
            EquipmentState::Idle => &self.idle,
            EquipmentState::Circulate => &self.circulate,
            EquipmentState::Cool => &self.cool,
            EquipmentState::Heat => &self.heat,
            EquipmentState::HeatAux => &self.heat_aux,
        }
    }

    fn get_mut(&mut self, state: EquipmentState) -> &mut StateTiming {
        match state {
            EquipmentState::Idle => &mut self.idle,
            EquipmentState::Circulate => &mut self.circulate,
            EquipmentState::Cool => &mut self.cool,
            EquipmentState::Heat => &mut self.heat,
            EquipmentState::HeatAux => &mut self.heat_aux,
        }
    }
}

/// A named output owned by the equipment machine, with the timestamps of its
/// last transitions.
pub struct Relay {
    name: &'static str,
    output: Box<dyn DigitalOutput>,
    last_high_ms: u64,
    last_low_ms: u64,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("name", &self.name)
            .field("high", &self.output.read())
            .field("last_high_ms", &self.last_high_ms)
            .field("last_low_ms", &self.last_low_ms)
            .finish()
    }
}

impl Relay {
    pub fn new(name: &'static str, output: Box<dyn DigitalOutput>) -> Self {
        Self {
            name,
            output,
            last_high_ms: 0,
            last_low_ms: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.output.read()
    }

    pub fn last_high_ms(&self) -> u64 {
        self.last_high_ms
    }

    pub fn last_low_ms(&self) -> u64 {
        self.last_low_ms
    }

    fn set(&mut self, high: bool, now_ms: u64) {
        let was_high = self.output.read();
        if let Err(err) = self.output.write(high) {
            warn!(relay = self.name, "relay write failed: {err}");
        }
        let is_high = self.output.read();
        if is_high != was_high {
            if is_high {
                self.last_high_ms = now_ms;
            } else {
                self.last_low_ms = now_ms;
            }
        }
    }

    fn force_low(&mut self, now_ms: u64) {
        if let Err(err) = self.output.write(false) {
            warn!(relay = self.name, "relay write failed: {err}");
        }
        self.last_low_ms = now_ms;
    }

    fn status(&self) -> ComponentStatus {
        ComponentStatus {
            last_active_ms: self.last_high_ms,
            last_inactive_ms: self.last_low_ms,
            is_active: self.is_active(),
        }
    }
}

#[derive(Debug)]
pub struct HvacRelays {
    pub compressor: Relay,
    pub heat_pump: Relay,
    pub aux_heat: Relay,
    pub fan: Relay,
}

impl HvacRelays {
    pub fn new(
        compressor: Box<dyn DigitalOutput>,
        heat_pump: Box<dyn DigitalOutput>,
        aux_heat: Box<dyn DigitalOutput>,
        fan: Box<dyn DigitalOutput>,
    ) -> Self {
        Self {
            compressor: Relay::new("compressor", compressor),
            heat_pump: Relay::new("heat_pump", heat_pump),
            aux_heat: Relay::new("aux_heat", aux_heat),
            fan: Relay::new("fan", fan),
        }
    }

    pub fn emulated(config: &HvacConfig) -> Self {
        let wiring = config.wiring;
        Self::new(
            Box::new(EmulatedOutput::new(wiring.compressor)),
            Box::new(EmulatedOutput::new(wiring.heat_pump)),
            Box::new(EmulatedOutput::new(wiring.aux_heat)),
            Box::new(EmulatedOutput::new(wiring.fan)),
        )
    }

    fn drive(&mut self, state: EquipmentState, now_ms: u64) {
        let (compressor, heat_pump, aux_heat, fan) = output_pattern(state);
        self.compressor.set(compressor, now_ms);
        self.heat_pump.set(heat_pump, now_ms);
        self.aux_heat.set(aux_heat, now_ms);
        self.fan.set(fan, now_ms);
    }

    fn force_all_low(&mut self, now_ms: u64) {
        self.compressor.force_low(now_ms);
        self.heat_pump.force_low(now_ms);
        self.aux_heat.force_low(now_ms);
        self.fan.force_low(now_ms);
    }
}

/// (compressor, heat pump, aux heat, fan)
fn output_pattern(state: EquipmentState) -> (bool, bool, bool, bool) {
    match state {
        EquipmentState::Idle => (false, false, false, false),
        EquipmentState::Circulate => (false, false, false, true),
        EquipmentState::Cool => (true, false, false, true),
        EquipmentState::Heat => (false, true, false, true),
        EquipmentState::HeatAux => (false, true, true, true),
    }
}

/// Equipment state machine. Requested states are queued and only executed by
/// [`Hvac::clock`] once the minimum dwell time of the current state has
/// passed.
#[derive(Debug)]
pub struct Hvac {
    state: EquipmentState,
    pending: Option<PendingTransition>,
    times: StateTimes,
    min_cycle_ms: u64,
    min_idle_ms: u64,
    relays: HvacRelays,
}

impl Hvac {
    /// Starts in `Idle` with every output low. Entering idle stamps
    /// `times.idle.last_active_ms`, so the idle dwell applies after a restart.
    pub fn new(config: &HvacConfig, relays: HvacRelays, times: StateTimes, now_ms: u64) -> Self {
        let mut hvac = Self {
            state: EquipmentState::Idle,
            pending: None,
            times,
            min_cycle_ms: config.min_cycle_ms,
            min_idle_ms: config.min_idle_ms,
            relays,
        };
        hvac.relays.force_all_low(now_ms);
        hvac.enter(EquipmentState::Idle, now_ms);
        hvac
    }

    pub fn state(&self) -> EquipmentState {
        self.state
    }

    pub fn pending(&self) -> Option<&PendingTransition> {
        self.pending.as_ref()
    }

    pub fn times(&self) -> &StateTimes {
        &self.times
    }

    pub fn relays(&self) -> &HvacRelays {
        &self.relays
    }

    /// Earliest time the current state may be left.
    pub fn dwell_deadline_ms(&self) -> u64 {
        let min_dwell = if self.state.is_idle() {
            self.min_idle_ms
        } else {
            self.min_cycle_ms
        };
        self.times
            .get(self.state)
            .last_active_ms
            .saturating_add(min_dwell)
    }

    /// Requests `target`, replacing any pending transition. Returns `true`
    /// when the pending transition changed.
    pub fn queue(&mut self, target: EquipmentState, now_ms: u64) -> bool {
        if target == self.state {
            return false;
        }

        let mut next = PendingTransition {
            target,
            due_ms: now_ms.max(self.dwell_deadline_ms()),
            idle_first: !target.is_idle() && !self.state.is_idle(),
        };

        if self.state == EquipmentState::Heat && target == EquipmentState::HeatAux {
            // Aux heat augments the running heat pump.
            next.due_ms = now_ms;
            next.idle_first = false;
        } else if target == EquipmentState::Circulate {
            next.idle_first = false;
        }

        if self.pending == Some(next) {
            return false;
        }

        debug!(
            from = self.state.as_str(),
            to = target.as_str(),
            due_ms = next.due_ms,
            idle_first = next.idle_first,
            "equipment transition queued"
        );
        self.pending = Some(next);
        true
    }

    /// Executes the pending transition if it is due. Returns `true` when the
    /// equipment state changed.
    pub fn clock(&mut self, now_ms: u64) -> bool {
        let Some(next) = self.pending else {
            return false;
        };
        if now_ms < next.due_ms {
            return false;
        }

        if next.idle_first {
            self.enter(EquipmentState::Idle, now_ms);
            self.pending = Some(PendingTransition {
                target: next.target,
                due_ms: now_ms.saturating_add(self.min_idle_ms),
                idle_first: false,
            });
        } else {
            self.enter(next.target, now_ms);
            self.pending = None;
        }
        true
    }

    pub fn component_state(&self) -> ComponentStates {
        ComponentStates {
            compressor: self.relays.compressor.status(),
            heat_pump: self.relays.heat_pump.status(),
            aux_heat: self.relays.aux_heat.status(),
            fan: self.relays.fan.status(),
        }
    }

    pub fn snapshot(&self) -> HvacSnapshot {
        HvacSnapshot {
            state: self.state,
            next_action: self.pending,
            times: self.times,
            components: self.component_state(),
        }
    }

    fn enter(&mut self, state: EquipmentState, now_ms: u64) {
        self.relays.drive(state, now_ms);
        self.times.get_mut(state).last_active_ms = now_ms;
        self.times.get_mut(self.state).last_inactive_ms = now_ms;

        if state != self.state {
            info!(
                from = self.state.as_str(),
                to = state.as_str(),
                "equipment state changed"
            );
        }
        self.state = state;
    }
}
