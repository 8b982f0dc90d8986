//! distbuild worker - executes one build step per request.

pub mod commands;
pub mod server;
pub mod setup;
