//! Configuration: typed schema + JSON loader with env overrides.

pub mod loader;
pub mod schema;

pub use loader::{load_config, load_workspace_env, save_config};
pub use schema::Config;
