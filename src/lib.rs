//! Vocare Deployer Library
//!
//! Provisions the Azure resources behind the Vocare voice stack, federates the
//! workload identity, synchronizes Key Vault secrets, rolls the stack out to
//! AKS and backs the whole thing up. The `vocarectl` binary is a thin CLI over
//! these modules.
//!
//! Every external system sits behind a trait so the algorithms here are tested
//! against in-memory fakes:
//!
//! - [`provider::CloudApi`] / [`provider::VaultStore`] - Azure control and data plane
//! - [`cluster::ClusterApi`] - Kubernetes API
//! - [`deploy::ManifestRenderer`] / [`deploy::PortForwarder`] - Helm and kubectl
//! - [`backup::Archiver`] - tar

pub mod backup;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod deploy;
pub mod error;
pub mod identity;
pub mod logging;
pub mod provider;
pub mod reconciler;
pub mod retry;
pub mod secrets;
pub mod summary;

pub use error::{Component, Condition, DeployerError, Warning};
