#![deny(unsafe_code)]

mod backend;
mod controller;

pub use backend::{PrefetchBackend, SystemBackend};
pub use controller::{PrefetchController, Request};
