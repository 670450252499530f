//! Filter language
//!
//! Clients receive flow filters as a compact binary tree. Operators write
//! them in a small prefix language, e.g. `&(i(10.0.0.1),p(80,443))`.
//!
//! - `parser`: text to [`Filter`].
//! - `expression`: the tree itself, its binary codec and canonical text.

pub mod expression;
pub mod parser;

pub use expression::{Filter, SetMode};
pub use parser::parse;
