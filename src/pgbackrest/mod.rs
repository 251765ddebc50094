//! pgBackRest configuration generation

mod config;

pub use config::*;
