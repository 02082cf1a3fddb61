//! Repositories and services built on the core store.

pub mod context;
pub mod patterns;
pub mod tasks;
