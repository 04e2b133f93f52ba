pub mod fs_store;
pub mod http_function_client;
pub mod jetstream_source;
pub mod s3_store;
pub mod sqs_source;
