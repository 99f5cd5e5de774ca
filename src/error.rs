use thiserror::Error;

use crate::config::ConfigError;
use crate::event::RouterError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
    // config
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type BuslineResult<T> = Result<T, Error>;
