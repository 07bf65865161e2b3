pub mod disk;
pub mod task_dir;

// Re-export commonly used types and functions for convenience
pub use disk::{format_size_mb, free_space_mb};
pub use task_dir::{check_target_readable, TaskDir};
