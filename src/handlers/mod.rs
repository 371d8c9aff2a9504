//! Message handlers
//!
//! ## Key Components
//!
//! - [`Handler`] - Main trait for user-supplied units of work
//! - [`handler_fn`] - Adapter for async closures
//! - [`HandlerRegistry`] - Routes messages to handlers by message type
//!
//! ## Example
//!
//! ```rust,ignore
//! use pollwork::handlers::{handler_fn, HandlerRegistry};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("sync.product", Arc::new(handler_fn(|message| async move {
//!     push_product(&message.payload).await
//! })))?;
//! ```

mod registry;
mod traits;

pub use registry::{HandlerRegistry, RegistryError};
pub use traits::{FnHandler, Handler, HandlerError, handler_fn};
