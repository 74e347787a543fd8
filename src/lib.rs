//! image-store - Uniform image storage across object stores and local disk
//!
//! This crate provides:
//! - An `ImageStore` capability implemented identically by S3, GCS and the
//!   local filesystem
//! - `PathMapper`, a regex-driven mapping from flat identifiers to sharded paths
//! - `IdentifierGenerator`, which keeps verified-unique identifiers ready
//!   ahead of demand
//! - `StoreFactory`, which builds all of the above from declarative config

pub mod config;
pub mod factory;
pub mod generator;
pub mod object;
pub mod object_store;
pub mod path_mapper;
#[cfg(test)]
pub mod testutil;

pub use config::{Config, ConfigError, StoreConfig};
pub use factory::StoreFactory;
pub use generator::{Alphabet, GeneratorError, GeneratorOptions, IdentifierGenerator};
pub use object::StoreObject;
pub use object_store::{ImageStore, StoreError, StoreSet};
pub use path_mapper::PathMapper;
