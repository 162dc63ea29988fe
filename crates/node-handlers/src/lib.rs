pub mod error;
pub mod http;
pub mod llm;
pub mod registry;
pub mod sql;
pub mod template;
pub mod vector;

pub use error::HandlerError;
pub use registry::{builtin_registry, HandlerContext, HandlerRegistry, NodeHandler};
