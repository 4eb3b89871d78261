use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to drive output on pin {pin}: {reason}")]
    Write { pin: i32, reason: String },
}

/// A two-state digital output (relay coil, GPIO line).
pub trait DigitalOutput: Send {
    fn write(&mut self, high: bool) -> Result<(), OutputError>;

    fn read(&self) -> bool;
}

/// Output used when no hardware is attached. It simply remembers the last
/// written level.
#[derive(Debug, Clone, Default)]
pub struct EmulatedOutput {
    pin: i32,
    high: bool,
}

impl EmulatedOutput {
    pub fn new(pin: i32) -> Self {
        Self { pin, high: false }
    }

    pub fn pin(&self) -> i32 {
        self.pin
    }
}

impl DigitalOutput for EmulatedOutput {
    fn write(&mut self, high: bool) -> Result<(), OutputError> {
        self.high = high;
        Ok(())
    }

    fn read(&self) -> bool {
        self.high
    }
}
