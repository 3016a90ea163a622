// Domain types shared across the engine: states, errors, DSL specs,
// expression evaluation, configuration.

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod expr;
pub mod spec;
pub mod states;

pub use auth::AuthContext;
pub use config::EngineConfig;
pub use context::Context;
pub use error::{EngineError, Result};
pub use states::State;
