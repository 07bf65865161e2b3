pub mod diary;
pub mod machine;
pub mod task;

// Re-export commonly used types for convenience
pub use diary::URLDiary;
pub use machine::{Longterm, Machine, SERVICE_TAG};
pub use task::{Target, TargetCategory, Task, TaskError, TaskStatus, TaskType};
