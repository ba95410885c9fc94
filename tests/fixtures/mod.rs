//! Shared fixtures for the integration tests.
#![allow(dead_code)]

pub mod executor;
pub mod harness;
pub mod intake;
