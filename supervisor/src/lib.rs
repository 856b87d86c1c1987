mod error;
mod instance;
mod intercept;
mod pty;
mod status;
mod watchdog;

pub use error::InstanceError;
pub use instance::{Instance, InstanceOptions, OutputSink, StatusCallback};
pub use status::ServerStatus;
pub use watchdog::{Watchdog, WatchdogCondition};
