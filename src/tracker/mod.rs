pub mod git;

pub use git::{GitTracker, count_changed_files};
