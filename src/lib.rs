#[macro_use]
extern crate tracing;

pub mod controller;
pub mod display_context;
pub mod event_queue;
pub mod external_event_handler;
pub mod file_node;
pub mod interface;
pub mod refresh_rate_calculator;
pub mod residency;
pub mod statistics;
pub mod types;
pub mod utils;

pub use controller::{ControllerState, VariableRefreshRateController};
