//! Command-line runner for oq search expressions.
//!
//! Evaluates a script given on the command line or read from a file
//! against an in-memory object model and prints the result. Mostly
//! useful for trying out expressions and for scripting around the
//! engine.

pub mod cli;

pub use cli::Cli;
