pub mod api;
pub mod controllers;
pub mod util;
pub mod workload;

#[cfg(test)]
pub mod tests;
