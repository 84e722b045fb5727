#![deny(clippy::expect_used)]
#![deny(clippy::unwrap_used)]

pub mod camera;
pub mod capture;
pub mod config;
pub mod cycle;
pub mod error;
pub mod positions;
pub mod preset_map;
pub mod scheduler;
pub mod server;
pub mod transport;

pub use error::{OurError, OurResult};
