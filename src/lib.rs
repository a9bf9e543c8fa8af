pub mod accounting;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod loader;
pub mod manifest;
pub mod output;
pub mod runner;
pub mod store;
pub mod summary;
