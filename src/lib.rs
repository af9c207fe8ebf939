//! flmap: live camera filter viewer
//!
//! Captures frames from a camera, runs a per-frame image transform on the
//! capture thread, and draws the newest result as a full-screen GPU quad.

pub mod capture;
pub mod config;
pub mod frame;
pub mod orchestrator;
pub mod processing;
pub mod render;
pub mod slot;
pub mod utils;
