use std::sync::Arc;

use thiserror::Error;

/// Malformed request shape, reported synchronously to the caller.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("A success callback is required")]
    MissingCallback,

    #[error("Unit name must not be empty")]
    EmptyName,

    #[error("Dependency at position {position} has an empty name")]
    EmptyDependency { position: usize },

    #[error("'{0}' is reserved for the dynamic require capability")]
    ReservedName(String),

    #[error("Alias '{from}' -> '{to}' involves the dynamic require sentinel")]
    ReservedAlias { from: String, to: String },

    #[error("A module defined directly on the resolver needs a name")]
    AnonymousDefine,

    #[error("Dynamic request must not carry a name, got '{0}'")]
    NamedRequest(String),

    #[error("Couldn't parse resolver options.\n{0}")]
    Options(#[from] serde_json::Error),
}

/// Failure of a unit, delivered to its error callback.
///
/// Errors are shared between every waiter of a failed unit, so the user level
/// cause is kept behind an `Arc`.
#[derive(Debug, Error, Clone)]
pub enum ResolveError {
    #[error("Couldn't fetch module '{name}'.\n{error}")]
    Fetch {
        name: String,
        error: Arc<anyhow::Error>,
    },

    #[error("Dependency '{dependency}' of {unit} failed.\n{cause}")]
    Dependency {
        unit: String,
        dependency: String,
        cause: Arc<ResolveError>,
    },

    #[error("{unit} failed while executing.\n{error}")]
    Execution {
        unit: String,
        error: Arc<anyhow::Error>,
    },
}

impl ResolveError {
    /// Follows the chain of dependency failures down to the unit that failed
    /// first.
    pub fn root(&self) -> &ResolveError {
        match self {
            ResolveError::Dependency { cause, .. } => cause.root(),
            other => other,
        }
    }
}
