// Common test utilities

pub mod engine;
pub mod harness;

pub use engine::*;
pub use harness::*;
