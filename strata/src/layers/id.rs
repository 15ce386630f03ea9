//! Layer identifiers.

use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier of a filesystem layer.
///
/// The graph id is the stable string rendering used as the store key and the
/// lock key. Two ids are the same layer iff their graph ids are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LayerId {
    /// A layer pulled from a registry; the graph id is the image id itself.
    Docker(String),
    /// The read-write rootfs layer of a container; the graph id is the sha256
    /// of the container handle so arbitrary handles are safe as directory names.
    Container(String),
}

impl LayerId {
    pub fn docker(image_id: impl Into<String>) -> Self {
        LayerId::Docker(image_id.into())
    }

    pub fn container(handle: impl Into<String>) -> Self {
        LayerId::Container(handle.into())
    }

    pub fn graph_id(&self) -> String {
        match self {
            LayerId::Docker(id) => id.clone(),
            LayerId::Container(handle) => hex::encode(Sha256::digest(handle.as_bytes())),
        }
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.graph_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_graph_id_is_image_id() {
        assert_eq!(LayerId::docker("abc123").graph_id(), "abc123");
    }

    #[test]
    fn test_container_graph_id_is_sha256_hex() {
        let id = LayerId::container("my-container");
        let graph_id = id.graph_id();
        assert_eq!(graph_id.len(), 64);
        assert!(graph_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(graph_id, LayerId::container("my-container").graph_id());
        assert_ne!(graph_id, "my-container");
    }

    #[test]
    fn test_display_matches_graph_id() {
        let id = LayerId::container("handle");
        assert_eq!(id.to_string(), id.graph_id());
    }
}
