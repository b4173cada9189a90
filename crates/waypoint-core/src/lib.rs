//! Waypoint Core - domain types, errors, events and configuration shared by
//! the history storage crates.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{HistoryConfig, WaypointConfig};
pub use error::{Result, WaypointError};
pub use events::HistoryEvent;
pub use types::*;
