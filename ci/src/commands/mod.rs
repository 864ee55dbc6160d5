// Lint commands
mod clippy;
mod format;

pub use clippy::*;
pub use format::*;

// Test commands
mod doc_check;
mod loom_test;

pub use doc_check::*;
pub use loom_test::*;
pub use test::*;
