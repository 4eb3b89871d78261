use std::{collections::VecDeque, fmt};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::{EmulatorBounds, SensorConfig},
    types::SensorSnapshot,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SensorError {
    #[error("no reading available yet")]
    NoData,
    #[error("latest reading is stale ({age_ms} ms old)")]
    Stale { age_ms: u64 },
    #[error("sensor hardware error: {0}")]
    Hardware(String),
    #[error("reading out of range: {0}")]
    OutOfRange(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub temperature: f32,
    pub humidity: f32,
}

/// Offset-corrected reading stamped with the sample time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: f32,
    pub humidity: f32,
    #[serde(rename = "atMs")]
    pub at_ms: u64,
}

/// Source of raw temperature/humidity samples.
pub trait RawSensor: Send {
    fn read(&mut self) -> Result<RawReading, SensorError>;
}

/// Bounded pseudo-random stand-in used when no hardware is attached.
#[derive(Debug, Clone)]
pub struct EmulatedSensor {
    bounds: EmulatorBounds,
}

impl EmulatedSensor {
    pub fn new(bounds: EmulatorBounds) -> Self {
        Self { bounds }
    }
}

fn sample_between(rng: &mut impl Rng, low: f32, high: f32) -> f32 {
    if low >= high {
        low
    } else {
        rng.gen_range(low..=high)
    }
}

impl RawSensor for EmulatedSensor {
    fn read(&mut self) -> Result<RawReading, SensorError> {
        let mut rng = rand::thread_rng();
        Ok(RawReading {
            temperature: sample_between(&mut rng, self.bounds.min_temp, self.bounds.max_temp),
            humidity: sample_between(
                &mut rng,
                self.bounds.min_humidity,
                self.bounds.max_humidity,
            ),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AverageState {
    pub temperature: f32,
    pub humidity: f32,
    /// Change of the average temperature, `delta / elapsed_ms * 60_000`.
    pub speed: f32,
}

/// Rolling-window averager over a raw sensor.
pub struct TemperatureSensor {
    raw: Box<dyn RawSensor>,
    temp_offset: f32,
    humidity_offset: f32,
    precision: usize,
    readings: VecDeque<SensorReading>,
    average: AverageState,
}

impl fmt::Debug for TemperatureSensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemperatureSensor")
            .field("precision", &self.precision)
            .field("readings", &self.readings.len())
            .field("average", &self.average)
            .finish()
    }
}

impl TemperatureSensor {
    pub fn new(config: &SensorConfig, raw: Box<dyn RawSensor>) -> Self {
        let precision = config.precision.max(1);
        Self {
            raw,
            temp_offset: config.temp_offset,
            humidity_offset: config.humidity_offset,
            precision,
            readings: VecDeque::with_capacity(precision),
            average: AverageState {
                temperature: config.initial_temp,
                humidity: config.initial_humidity,
                speed: 0.0,
            },
        }
    }

    /// One calibrated sample.
    pub fn read(&mut self, now_ms: u64) -> Result<SensorReading, SensorError> {
        let raw = self.raw.read()?;
        if !raw.temperature.is_finite() {
            return Err(SensorError::OutOfRange(raw.temperature));
        }
        if !raw.humidity.is_finite() {
            return Err(SensorError::OutOfRange(raw.humidity));
        }
        Ok(SensorReading {
            temperature: raw.temperature + self.temp_offset,
            humidity: raw.humidity + self.humidity_offset,
            at_ms: now_ms,
        })
    }

    /// Samples once and recomputes the averages and speed. A failed read
    /// leaves every value untouched.
    pub fn clock(&mut self, now_ms: u64) -> AverageState {
        let reading = match self.read(now_ms) {
            Ok(reading) => reading,
            Err(err) => {
                warn!("sensor read failed, keeping last average: {err}");
                return self.average;
            }
        };

        let elapsed_ms = self
            .readings
            .back()
            .map(|previous| now_ms.saturating_sub(previous.at_ms));
        let previous_temp = self.average.temperature;

        self.push(reading);
        let (temperature, humidity) = self.mean();

        let speed = match elapsed_ms {
            Some(elapsed) if elapsed > 0 => {
                (temperature - previous_temp) / elapsed as f32 * 60_000.0
            }
            _ => 0.0,
        };

        self.average = AverageState {
            temperature,
            humidity,
            speed,
        };
        debug!(temperature, humidity, speed, "sensor sampled");
        self.average
    }

    pub fn average(&self) -> AverageState {
        self.average
    }

    pub fn readings(&self) -> impl Iterator<Item = &SensorReading> {
        self.readings.iter()
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            temperature: self.average.temperature,
            humidity: self.average.humidity,
            speed: self.average.speed,
        }
    }

    fn push(&mut self, reading: SensorReading) {
        while self.readings.len() >= self.precision {
            self.readings.pop_front();
        }
        self.readings.push_back(reading);
    }

    fn mean(&self) -> (f32, f32) {
        if self.readings.is_empty() {
            return (self.average.temperature, self.average.humidity);
        }
        let count = self.readings.len() as f32;
        let (temperature, humidity) = self
            .readings
            .iter()
            .fold((0.0, 0.0), |(t, h), reading| {
                (t + reading.temperature, h + reading.humidity)
            });
        (temperature / count, humidity / count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::{collections::VecDeque, fmt};

    /// Replays scripted results, then reports missing data.
    struct ScriptedSensor {
        script: VecDeque<Result<RawReading, SensorError>>,
    }

    impl ScriptedSensor {
        fn temps(temps: &[f32]) -> Box<Self> {
            Box::new(Self {
                script: temps
                    .iter()
                    .map(|&temperature| {
                        Ok(RawReading {
                            temperature,
                            humidity: 40.0,
                        })
                    })
                    .collect(),
            })
        }
    }

    impl RawSensor for ScriptedSensor {
        fn read(&mut self) -> Result<RawReading, SensorError> {
            self.script.pop_front().unwrap_or(Err(SensorError::NoData))
        }
    }

    fn config(precision: usize) -> SensorConfig {
        SensorConfig {
            precision,
            ..SensorConfig::default()
        }
    }

    #[test]
    fn first_sample_has_zero_speed() {
        let mut sensor = TemperatureSensor::new(&config(3), ScriptedSensor::temps(&[68.0]));
        let average = sensor.clock(1_000);

        assert_eq!(average.temperature, 68.0);
        assert_eq!(average.humidity, 40.0);
        assert_eq!(average.speed, 0.0);
    }

    #[test]
    fn speed_follows_average_change_over_elapsed_time() {
        let mut sensor =
            TemperatureSensor::new(&config(2), ScriptedSensor::temps(&[70.0, 72.0]));
        sensor.clock(0);
        let average = sensor.clock(60_000);

        // average moved 70 -> 71 over one minute
        assert_eq!(average.temperature, 71.0);
        assert!((average.speed - 1.0).abs() < 1e-4);
    }

    #[test]
    fn window_is_bounded_by_precision() {
        let mut sensor = TemperatureSensor::new(
            &config(2),
            ScriptedSensor::temps(&[60.0, 70.0, 80.0]),
        );
        sensor.clock(0);
        sensor.clock(1_000);
        let average = sensor.clock(2_000);

        let temps: Vec<f32> = sensor.readings().map(|reading| reading.temperature).collect();
        assert_eq!(temps, vec![70.0, 80.0]);
        assert_eq!(average.temperature, 75.0);
    }

    #[test]
    fn offsets_are_applied() {
        let sensor_config = SensorConfig {
            temp_offset: -1.5,
            humidity_offset: 2.0,
            ..config(1)
        };
        let mut sensor = TemperatureSensor::new(&sensor_config, ScriptedSensor::temps(&[70.0]));
        let reading = sensor.read(5).unwrap();

        assert_eq!(reading.temperature, 68.5);
        assert_eq!(reading.humidity, 42.0);
        assert_eq!(reading.at_ms, 5);
    }

    #[test]
    fn read_failure_keeps_last_average() {
        let raw = Box::new(ScriptedSensor {
            script: VecDeque::from(vec![
                Ok(RawReading {
                    temperature: 70.0,
                    humidity: 40.0,
                }),
                Err(SensorError::Hardware("checksum".into())),
                Ok(RawReading {
                    temperature: 74.0,
                    humidity: 40.0,
                }),
            ]),
        });
        let mut sensor = TemperatureSensor::new(&config(2), raw);
        sensor.clock(0);

        let unchanged = sensor.clock(60_000);
        assert_eq!(unchanged.temperature, 70.0);
        assert_eq!(sensor.readings().count(), 1);

        // speed spans the gap back to the last good sample
        let recovered = sensor.clock(120_000);
        assert_eq!(recovered.temperature, 72.0);
        assert!((recovered.speed - 1.0).abs() < 1e-4);
    }

    #[test]
    fn failure_before_any_sample_keeps_initial_average() {
        let mut sensor = TemperatureSensor::new(&config(3), ScriptedSensor::temps(&[]));
        let average = sensor.clock(0);

        assert_eq!(average.temperature, 72.0);
        assert_eq!(average.speed, 0.0);
    }

    #[test]
    fn emulator_stays_within_bounds() {
        let bounds = EmulatorBounds::default();
        let mut emulator = EmulatedSensor::new(bounds);
        for _ in 0..200 {
            let reading = emulator.read().unwrap();
            assert!((bounds.min_temp..=bounds.max_temp).contains(&reading.temperature));
            assert!((bounds.min_humidity..=bounds.max_humidity).contains(&reading.humidity));
        }
    }

    proptest! {
        #[test]
        fn average_is_mean_of_most_recent_window(
            precision in 1usize..8,
            temps in prop::collection::vec(40.0f32..100.0, 1..30),
        ) {
            let mut sensor = TemperatureSensor::new(&config(precision), ScriptedSensor::temps(&temps));
            let mut average = sensor.average();
            for (i, _) in temps.iter().enumerate() {
                average = sensor.clock(i as u64 * 1_000);
            }

            let window: Vec<f32> = temps.iter().rev().take(precision).rev().copied().collect();
            let kept: Vec<f32> = sensor.readings().map(|reading| reading.temperature).collect();
            prop_assert_eq!(&kept, &window);

            let mean = window.iter().sum::<f32>() / window.len() as f32;
            prop_assert!((average.temperature - mean).abs() < 1e-3);
            prop_assert!((average.humidity - 40.0).abs() < 1e-3);
        }
    }
}
