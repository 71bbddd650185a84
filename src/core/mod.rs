//! Core engine — types, parsing, resolution, substitution, synthesis.

pub mod error;
pub mod generate;
pub mod graph;
pub mod manifest;
pub mod parser;
pub mod placeholder;
pub mod resolver;
pub mod state;
pub mod substitute;
pub mod types;
