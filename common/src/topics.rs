pub const TOPIC_SENSOR_TEMP: &str = "climate/sensor/temperature";
pub const TOPIC_SENSOR_HUMIDITY: &str = "climate/sensor/humidity";
pub const TOPIC_SENSOR_STATUS: &str = "climate/sensor/status";

pub const TOPIC_CONTROLLER_STATE: &str = "climate/controller/state";

pub const TOPIC_CMD_TARGET: &str = "climate/cmnd/target";
pub const TOPIC_CMD_MODE: &str = "climate/cmnd/mode";
pub const TOPIC_CMD_ENERGY_MODE: &str = "climate/cmnd/energy-mode";

