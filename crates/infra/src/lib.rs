//! Infrastructure layer: job storage, the worker runtime, processors and bus adapters.

pub mod event_bus;
pub mod jobs;
pub mod processors;
pub mod workers;

#[cfg(test)]
mod integration_tests;
