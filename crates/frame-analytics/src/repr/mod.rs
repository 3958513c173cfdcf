//! Trained tree representation and the visitor used to export it.

mod forest;
pub(crate) mod tree;
mod visitor;

pub use forest::{Forest, ForestValidationError};
pub use tree::{Node, Split, Tree, TreeValidationError};
pub use visitor::ModelVisitor;
