//! Object explorer: cached hierarchical browsing over browse backends.

mod cache;
mod node;

pub use cache::TreeSessionCache;
pub use node::{Expansion, TreeNode};
