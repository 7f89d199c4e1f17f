//! Process-wide locations: platform directories and the artifact cache.

pub mod cache;
pub mod utils;
