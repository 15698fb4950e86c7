//! # Azure Providers
//!
//! - `cli`: control plane through the `az` CLI
//! - `key_vault`: Key Vault data plane for secret writes

pub mod cli;
pub mod key_vault;

pub use cli::AzCli;
pub use key_vault::AzureKeyVault;
