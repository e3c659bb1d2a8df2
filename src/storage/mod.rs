//! S3 Backend Adapter (§4.G): storage abstraction plus two concrete backends.

mod filesystem;
mod s3;
mod traits;

pub use filesystem::FilesystemBackend;
pub use s3::S3BackendClient;
pub use traits::{
    ByteStream, CompletedPart, GetObjectResult, PutObjectRequest, S3Backend, StorageError,
    UploadPartResult,
};
