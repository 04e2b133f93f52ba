pub mod blob_path;
pub mod error;
pub mod models;
pub mod ports;
pub mod serializer;
