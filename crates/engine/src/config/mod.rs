//! Engine configuration: service locations, polling cadence and storage.

mod io;
mod model;
mod validation;

pub use io::{CONFIG_PATH_ENV, default_config_path, load_config, load_config_from_path};
pub use model::{EngineSettings, PollSettings, PollingConfig, RunwayConfig, ServicesConfig, StorageConfig};
pub use validation::{ConfigError, validate_config};
