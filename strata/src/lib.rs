//! Strata - container root filesystem layers
//!
//! This crate stores image layers on disk, tears them down again on btrfs
//! (nested subvolumes and quota groups included), and fetches whole images
//! from a v1 registry under a disk quota.

pub mod errors;
pub mod fetch;
pub mod layers;
pub mod layout;
pub mod manager;
pub mod options;
pub mod registry;
pub mod util;

pub use errors::{StrataError, StrataResult};
pub use fetch::{Env, FetchRequest, Image, LayerLocks, QuotaedReader, RemoteImageFetcher};
pub use layers::{
    BtrfsReclaimer, DirectoryLayerStore, LayerId, LayerMetadata, LayerStore, LayerStream,
};
pub use manager::{ImageReference, LayerManager};
pub use options::StrataOptions;
pub use registry::{RegistryProvider, RegistrySession, RepositoryData, V1Session};
pub use util::{CommandRunner, ProcessRunner};
