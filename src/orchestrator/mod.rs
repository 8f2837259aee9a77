pub mod auto_iterate;
pub mod prompt;

pub use auto_iterate::{AutoIterator, SessionExit};
pub use prompt::{build_retry_prompt, build_task_prompt};
