//! Attribution reporting engine: registration admission, report storage and
//! scheduling, delivery with retries, and the debug report side channels.

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod manager;
pub mod network;
pub mod observers;
pub mod policy;
pub mod queue;
pub mod routes;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
