//! # occystrap-cli
//!
//! Command-line surface for occystrap: URI and filter-spec parsing, the
//! pipeline builder that wires sources, filters and sinks together, and
//! the clap command definitions.

pub mod commands;
pub mod pipeline;
pub mod uri;
