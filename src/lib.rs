pub mod audio;

pub use audio::{Driver, DriverBuilder, DriverConfig, DriverError, DriverEvent};
