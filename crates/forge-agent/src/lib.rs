pub mod event;
pub mod instruction;
pub mod invoker;

pub use invoker::ClaudeInvoker;
