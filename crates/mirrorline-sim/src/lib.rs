//! Simulation harness for mirrorline page connections.

pub mod scenarios;
