// Scheduling loop: trigger acquisition, timing and dispatch

pub mod engine;

pub use engine::*;
