//! The herald binary's wiring: configuration, seed data, the dry-run
//! transport and the placeholder renderer

pub mod controller;
pub mod fixtures;
pub mod render;
pub mod transport;
