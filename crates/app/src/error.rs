//! Session manager errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Net(#[from] tally_net::Error),

    #[error(transparent)]
    Core(#[from] tally_core::Error),

    #[error("Session task is not running")]
    Closed,

    #[error("No saved session to resume")]
    NothingToResume,
}

pub type Result<T> = std::result::Result<T, Error>;
