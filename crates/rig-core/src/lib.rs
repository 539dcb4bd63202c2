pub mod client;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod mix;
pub mod orchestrator;
pub mod outcome;
pub mod poller;
pub mod pool;
pub mod preflight;
pub mod report;
pub mod retry;
pub mod stats;

#[cfg(test)]
mod testing;

pub use client::*;
pub use config::*;
pub use dispatcher::*;
pub use endpoint::*;
pub use mix::*;
pub use orchestrator::*;
pub use outcome::*;
pub use poller::*;
pub use pool::*;
pub use preflight::*;
pub use report::*;
pub use retry::*;
pub use stats::*;
