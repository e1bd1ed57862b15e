pub mod settings;

pub use settings::Config;

use crate::error::ShieldError;
use std::sync::Arc;

/// Loads, validates and logs the configuration from the environment.
///
/// A `.env` file in the working directory is read first if present.
pub fn load_config() -> Result<Arc<settings::Config>, ShieldError> {
    dotenv::dotenv().ok();

    let config = settings::Config::from_env();
    config.validate()?;
    config.log_settings();

    Ok(Arc::new(config))
}
