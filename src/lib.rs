//! Hadron cluster membership: partition placement, topology management & command distribution.

pub mod app;
#[cfg(test)]
mod app_test;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod database;
pub mod distribution;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod models;
pub mod prom;
pub mod storage;
pub mod topology;
pub mod utils;
#[cfg(test)]
mod utils_test;
