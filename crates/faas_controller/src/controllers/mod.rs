pub mod client;
pub mod events;
pub mod function_controller;
pub mod workqueue;

pub use function_controller::{run, ControllerConfig, Diagnostics, FunctionController, State};
