//! Scenario-based HTTP load testing engine.
//!
//! A validated plan (the hammer) drives a pool of virtual users, each
//! executing a multi-step HTTP scenario at scheduled tick times. Results
//! flow through a bounded, optionally sampled pipeline to a report sink.

pub mod assertion;
pub mod config;
pub mod data_source;
pub mod engine;
pub mod errors;
pub mod extractor;
pub mod interpolate;
pub mod pipeline;
pub mod plan;
pub mod report;
pub mod reporter;
pub mod requester;
pub mod runner;
pub mod schedule;

pub use config::PlanFile;
pub use engine::Engine;
pub use plan::Hammer;
