pub mod error;
pub mod node;
pub mod parser;

pub use parser::parse;
