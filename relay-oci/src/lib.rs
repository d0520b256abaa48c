//! Registry wire plumbing: image references, content digests, an HTTP client
//! for remote blob access, and a content-addressed filesystem blob store.

pub mod descriptor;
pub mod error;
pub mod reference;
pub mod registry;
pub mod store;

pub use descriptor::{Descriptor, Digest, MEDIA_TYPE_OCTET_STREAM};
pub use error::{OciError, Result};
pub use reference::ImageReference;
pub use registry::{Credentials, Keyring, RegistryClient, RemoteRepository};
pub use store::{BlobStore, BlobUpload};
