// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use thiserror::Error;

use crate::crawler::supervisor::LifecycleState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("Failed to initialize discoverers: {}", GroupErrors(.0))]
    DiscovererInit(Vec<GroupError>),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Cannot {action} while supervisor is {state}")]
    Lifecycle {
        state: LifecycleState,
        action: &'static str,
    },

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    /// True for failures caused by the supplied configuration rather than
    /// by the environment.
    pub fn is_config(&self) -> bool {
        match self {
            Error::Config(_) | Error::InvalidGlob(_) => true,
            Error::DiscovererInit(groups) => groups.iter().all(|g| g.error.is_config()),
            _ => false,
        }
    }
}

/// Construction failure of the Discoverer for one pattern group.
#[derive(Debug)]
pub struct GroupError {
    /// Index of the group in the list passed to `Supervisor::start`
    pub group: usize,
    pub error: Box<Error>,
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group {}: {}", self.group, self.error)
    }
}

struct GroupErrors<'a>(&'a [GroupError]);

impl fmt::Display for GroupErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
