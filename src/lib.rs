//! CDEM: Consensus-Driven Earnings Momentum agent
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod broker;
pub mod calendar;
pub mod llm;
pub mod strategy;
pub mod engine;
pub mod storage;
