use serde::{Deserialize, Serialize};
use tracing::debug;

pub const MIN_SCHEDULE_TARGET: f32 = 55.0;
pub const MAX_SCHEDULE_TARGET: f32 = 85.0;

/// One-shot target override at an absolute time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleItem {
    pub target: f32,
    #[serde(rename = "timeMs")]
    pub time_ms: u64,
}

impl ScheduleItem {
    pub fn is_valid(&self, now_ms: u64) -> bool {
        self.time_ms > now_ms
            && self.target.is_finite()
            && (MIN_SCHEDULE_TARGET..=MAX_SCHEDULE_TARGET).contains(&self.target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleSelector {
    First,
    Last,
    Index(usize),
}

/// Pending items, always sorted ascending by time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schedule {
    items: Vec<ScheduleItem>,
}

impl Schedule {
    pub fn new(items: Vec<ScheduleItem>, now_ms: u64) -> Self {
        let mut schedule = Self::default();
        schedule.set(items, now_ms);
        schedule
    }

    /// Replaces every item. Past or out-of-band items are dropped.
    pub fn set(&mut self, items: Vec<ScheduleItem>, now_ms: u64) {
        self.items.clear();
        self.add(items, now_ms);
    }

    /// Returns how many of `items` were accepted.
    pub fn add(&mut self, items: Vec<ScheduleItem>, now_ms: u64) -> usize {
        let before = self.items.len();
        self.items
            .extend(items.into_iter().filter(|item| item.is_valid(now_ms)));
        self.normalize();
        self.items.len() - before
    }

    /// Removes every selected item at once. Returns how many were removed.
    pub fn remove(&mut self, selectors: &[ScheduleSelector]) -> usize {
        if self.items.is_empty() {
            return 0;
        }
        let last = self.items.len() - 1;
        let mut marked = vec![false; self.items.len()];
        for selector in selectors {
            let index = match *selector {
                ScheduleSelector::First => 0,
                ScheduleSelector::Last => last,
                ScheduleSelector::Index(index) => index,
            };
            if let Some(mark) = marked.get_mut(index) {
                *mark = true;
            }
        }

        let mut flags = marked.iter();
        self.items.retain(|_| !flags.next().copied().unwrap_or(false));
        marked.iter().filter(|mark| **mark).count()
    }

    pub fn first(&self) -> Option<&ScheduleItem> {
        self.items.first()
    }

    pub fn last(&self) -> Option<&ScheduleItem> {
        self.items.last()
    }

    pub fn list(&self) -> &[ScheduleItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pops the earliest item once its time has passed.
    pub fn take_due(&mut self, now_ms: u64) -> Option<ScheduleItem> {
        if self.items.first()?.time_ms > now_ms {
            return None;
        }
        let item = self.items.remove(0);
        debug!(target = item.target, time_ms = item.time_ms, "schedule item due");
        Some(item)
    }

    fn normalize(&mut self) {
        self.items.sort_by_key(|item| item.time_ms);
    }
}
