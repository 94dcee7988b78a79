//! Persisted data models.

pub mod proto;
