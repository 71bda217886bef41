#![deny(dead_code)]
#![deny(unused_imports)]

//! Piecewise-exponential survival regression for character tables.
//!
//! The pipeline runs strictly in this order:
//!
//! 1. [`data`] reads the per-character table and resolves the covariate schema.
//! 2. [`discretize`] turns lifespans into exposure and death matrices.
//! 3. [`model`] binds the matrices to the Poisson hazard likelihood and priors.
//! 4. [`hmc`] draws the posterior trace with NUTS.
//! 5. [`evaluate`] turns the trace into per-character survival curves.
//! 6. [`format`] assembles the prediction document.
//!
//! [`pipeline::run`] wires these together behind a single [`config::PipelineConfig`].

pub mod compact;
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod discretize;
pub mod evaluate;
pub mod format;
pub mod hmc;
pub mod model;
pub mod pipeline;
