//! Model management: versioned registry, loaders, and hot-swap support.

mod history;
mod loader;
mod store;
mod version;

pub use history::{ActivationEntry, ActivationSource, VersionHistory, DEFAULT_MAX_HISTORY};
pub use loader::{EchoLoader, ModelConfig, ModelLoader};
pub use store::{
    LoadedModel, ModelRegistry, ModelStats, ModelStatsSnapshot, ModelSummary, RegistryConfig,
    RegistryError, VersionSummary,
};
pub use version::{ModelVersion, VersionError};
