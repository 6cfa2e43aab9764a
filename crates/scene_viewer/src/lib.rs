//! Client side of the scene streaming pipeline.
//!
//! Scenes are registered with the scheduler, streamed model-by-model into a
//! staging directory by a pool of loader workers, parsed, and handed to the
//! render thread through a single-consumer upload queue. The render thread is
//! the only place GPU calls happen.

pub mod app;
pub mod fault;
pub mod net;
pub mod renderer;
pub mod scene;
pub mod shutdown;
pub mod ui_log;
pub mod upload;
