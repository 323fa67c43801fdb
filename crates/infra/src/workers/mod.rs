//! Background listeners that run outside the worker runtime.

pub mod change_listener;

pub use change_listener::{ChangeFilter, ChangeListener, ListenerHandle};
