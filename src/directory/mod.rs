pub mod assets;
pub mod auth;
pub mod config;
pub mod resources;

pub use assets::{BulkAssetUploader, BulkUploadReport};
pub use auth::TokenProvider;
pub use config::DirectoryConfig;
