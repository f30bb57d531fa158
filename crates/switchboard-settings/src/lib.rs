//! Service settings: compiled defaults, an optional JSON file deep-merged on
//! top, then environment overrides.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::SettingsError;
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
