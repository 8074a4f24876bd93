pub mod arbiter;
pub mod catalog;
pub mod condition;
pub mod controller;
pub mod error;
pub mod logger;
pub mod platform;
pub mod profile;
pub mod registry;
pub mod settings;
pub mod sleep;
pub mod telemetry;
pub mod types;

pub use error::{Error, Result};
