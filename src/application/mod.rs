pub mod capture;
pub mod invoker;
pub mod puller;
pub mod worker_pool;
pub mod writer;
