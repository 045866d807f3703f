pub mod command;
pub mod registry;

pub use command::CommandTool;
pub use registry::ToolRegistry;
