//! 核心层：错误分类、取消传播、优雅关闭

pub mod cancel;
pub mod error;
pub mod shutdown;

pub use cancel::cancellable;
pub use error::AgentError;
pub use shutdown::{ShutdownManager, ShutdownReason};
