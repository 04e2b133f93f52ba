pub mod application;
pub mod config;
pub mod domain;
pub mod http_service;
pub mod infrastructure;

#[cfg(test)]
mod test_support;
