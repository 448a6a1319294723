//! Tool invoker: assistant subprocess execution and stream harmonization.

pub mod path;
pub mod stream;
pub mod tool;

pub use stream::StreamJsonParser;
pub use tool::{
    command_name, detect_tool, execute, execute_with_program, is_available, ExecuteRequest,
    InvokerError, ToolOutcome,
};
