// Public API - only expose the runner module
pub mod runner;

// Internal modules - organized by subsystem
mod config;
mod db;
mod pipeline;
mod snapshot;
mod telemetry;
