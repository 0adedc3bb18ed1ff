//! Domain model for documents, revisions and structured-table changes.
//!
//! # Responsibility
//! - Define canonical data structures shared by storage, editor and sync.
//! - Keep conflict-resolution ordering rules next to the data they order.
//!
//! # Invariants
//! - Revision ids and site ids are validated on construction.
//! - Document revision trees and column change records are disjoint: a
//!   document is never merged column-wise and a table row never has a
//!   revision tree.

pub mod change_record;
pub mod document;
pub mod revision;
pub mod revision_tree;
pub mod site;
pub mod table_schema;
