//! Organization key material and derivation services

mod material;
mod service;

pub use material::{KeyMaterialStore, KeyVersionParams, OrganizationKeyMaterial};
pub use service::KeyService;
