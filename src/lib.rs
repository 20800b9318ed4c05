#![deny(clippy::no_effect_underscore_binding)]
pub mod catalog;
pub mod config;
pub mod dataset;
pub mod genotype;
pub mod output;
pub mod params;
pub mod pipeline;
pub mod types;
