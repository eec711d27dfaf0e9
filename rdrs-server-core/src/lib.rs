pub mod auth;
pub mod batch;
pub mod buffer_pool;
pub mod catalog;
pub mod config;
pub mod error;
pub mod feature_store;
pub mod handler;
pub mod model;
pub mod native;
pub mod pk_read;
pub mod stat;
pub mod validators;
