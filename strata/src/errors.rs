//! Error types shared by the layer store, reclaimer and fetcher.

use thiserror::Error;

/// Result alias used across the crate.
pub type StrataResult<T> = Result<T, StrataError>;

/// Errors produced by layer storage, reclamation and remote fetching.
///
/// Variants are cheap to clone and compare so that a collaborator's error can
/// be handed back to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrataError {
    /// Layer store I/O or bookkeeping failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A layer (or other resource) is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// An external command failed or could not be spawned.
    #[error("command failed: {0}")]
    Command(String),

    /// Registry transport or protocol failure.
    #[error("registry error: {0}")]
    Registry(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// Registering a layer would exceed the caller's disk quota.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// Image resolution or download failed; names the failing step.
    #[error("could not fetch image {path} from registry {host}: {step}: {source}")]
    Fetch {
        step: String,
        host: String,
        path: String,
        #[source]
        source: Box<StrataError>,
    },

    /// A single layer could not be fetched from the current endpoint.
    #[error("layer {layer}: {step}: {source}")]
    LayerFetch {
        layer: String,
        step: String,
        #[source]
        source: Box<StrataError>,
    },

    /// Every endpoint was tried; carries the last observed cause.
    #[error("all endpoints failed: {0}")]
    EndpointsExhausted(Box<StrataError>),

    #[error("registry {endpoint} is missing from the insecure registry list ({insecure_registries:?})")]
    InsecureRegistry {
        endpoint: String,
        insecure_registries: Vec<String>,
    },
}

impl StrataError {
    /// Build a fetch error for a resolution step.
    pub fn fetch(
        step: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
        source: StrataError,
    ) -> Self {
        StrataError::Fetch {
            step: step.into(),
            host: host.into(),
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// Build a per-layer fetch error.
    pub fn layer(layer: impl Into<String>, step: impl Into<String>, source: StrataError) -> Self {
        StrataError::LayerFetch {
            layer: layer.into(),
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error (or a wrapped cause) is a quota overrun.
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            StrataError::QuotaExceeded => true,
            StrataError::LayerFetch { source, .. } | StrataError::Fetch { source, .. } => {
                source.is_quota_exceeded()
            }
            _ => false,
        }
    }

    /// Convert an `io::Error`, recovering a `StrataError` carried inside it.
    ///
    /// Readers such as `QuotaedReader` report quota overruns through the
    /// `io::Error` channel; this keeps them distinguishable from plain I/O
    /// failures once they reach the store.
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        // Archive readers may wrap the reader's error in their own io::Error.
        let mut cause: Option<&(dyn std::error::Error + 'static)> =
            err.get_ref().map(|e| e as &(dyn std::error::Error + 'static));
        while let Some(e) = cause {
            if let Some(inner) = e.downcast_ref::<StrataError>() {
                return inner.clone();
            }
            cause = match e.downcast_ref::<std::io::Error>() {
                Some(io) => io.get_ref().map(|e| e as &(dyn std::error::Error + 'static)),
                None => e.source(),
            };
        }
        StrataError::Storage(format!("{}: {}", context, err))
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::InvalidArgument(format!("invalid JSON: {}", err))
    }
}
