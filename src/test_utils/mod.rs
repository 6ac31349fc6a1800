//! Test utilities for the capture pipeline
//!
//! Synthetic payload generation and a mock camera, for exercising frame
//! assembly and the session lifecycle without USB hardware.

pub mod mock_device;
pub mod payload_generator;

pub use mock_device::*;
pub use payload_generator::*;
