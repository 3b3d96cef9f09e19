#![doc = include_str!("../README.md")]
mod error;
mod manager;
pub mod model;
pub mod path;
pub mod pattern;
mod repository;
mod storage;

pub use error::Error;
pub use manager::{ProjectHandle, StorageConfig, StorageEngine};
pub use pattern::{PathPattern, PathPatternBuilder};
pub use repository::Repository;
pub use storage::encryption::Kms;
