pub mod config;
pub mod controller;
pub mod logging;
pub mod notification;

pub use config::ControllerConfig;
pub use controller::{Controller, Project};
pub use notification::{NotificationManager, NotificationQueue};
