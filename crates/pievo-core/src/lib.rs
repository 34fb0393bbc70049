//! Core abstractions for pievo: the model-state domain and the secure storage contract.
//! This crate stays free of crypto and filesystem dependencies.

pub mod model;
pub mod storage;
