//! Configuration: engine settings (TOML) and the model catalog (YAML).

pub mod loader;
pub mod structs;

pub use loader::{default_config_path, load_config, load_models, save_config};
pub use structs::{Config, EngineSettings, ModelCatalog, ModelEntry};
