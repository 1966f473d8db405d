pub mod config;
pub mod deploy;
pub mod domain;
pub mod http;
pub mod id;
pub mod repository;
pub mod state;
pub mod store;
pub mod upload;
pub mod version;
