//! The `Plinth.toml` deployment manifest.
//!
//! ```toml
//! state_dir = ".plinth"
//!
//! [network]
//! id = "local-anvil"
//! rpc_url = "http://127.0.0.1:8545"
//! from = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
//!
//! [deploy]
//! confirmation_depth = 2
//!
//! [[contracts]]
//! name = "Token"
//! artifact = "out/Token.sol/Token.json"
//! args = [{ type = "uint256", value = "1000000" }]
//!
//! [[contracts]]
//! name = "Vesting"
//! artifact = "out/Vesting.sol/Vesting.json"
//! args = [{ contract = "Token" }, { type = "uint64", value = "31536000" }]
//! ```
//!
//! Any value can be overridden from the environment with the `PLINTH_` prefix and `__` as the
//! nesting separator, e.g. `PLINTH_NETWORK__RPC_URL`.

use std::path::{Path, PathBuf};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    artifact::load_bytecode,
    contract::{ConstructorArg, ContractSpec},
    orchestrator::DeployOptions,
    store::NetworkId,
};

/// The default name of the manifest file.
pub const MANIFEST_FILENAME: &str = "Plinth.toml";

/// Prefix of environment variables overriding manifest values.
pub const ENV_PREFIX: &str = "PLINTH_";

fn default_state_dir() -> PathBuf {
    PathBuf::from(".plinth")
}

/// The network contracts are deployed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Key of the network's deployment records.
    pub id: NetworkId,
    pub rpc_url: Url,
    /// Node-managed account that sends the deployment transactions.
    pub from: Address,
    /// Gas limit for every deployment; estimated by the node when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
}

/// A declared contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEntry {
    pub name: String,
    /// Compiled artifact holding the creation bytecode, relative to the manifest.
    pub artifact: PathBuf,
    #[serde(default)]
    pub args: Vec<ConstructorArg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub network: NetworkConfig,
    /// Directory of the deployment state, relative to the manifest.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub deploy: DeployOptions,
    #[serde(default)]
    pub contracts: Vec<ContractEntry>,

    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Manifest {
    /// Load a manifest from a file, or from `Plinth.toml` inside a directory, applying
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Manifest file or directory not found: {}", path.display());
        }

        let manifest_path = if path.is_dir() {
            path.join(MANIFEST_FILENAME)
        } else {
            path.to_path_buf()
        };

        let mut manifest: Self = Figment::new()
            .merge(Toml::file(&manifest_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load manifest {}", manifest_path.display()))?;

        manifest.base_dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        manifest.validate()?;

        tracing::info!(
            path = %manifest_path.display(),
            network = %manifest.network.id,
            contracts = manifest.contracts.len(),
            "Manifest loaded"
        );
        Ok(manifest)
    }

    /// Reject option values the orchestrator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.network.id.is_empty() {
            anyhow::bail!("network.id must not be empty");
        }
        if self.deploy.confirmation_depth == 0 {
            anyhow::bail!("deploy.confirmation_depth must be at least 1");
        }
        if self.deploy.confirmation_timeout_ms == 0 {
            anyhow::bail!("deploy.confirmation_timeout_ms must be positive");
        }
        if self.deploy.poll_interval_ms == 0 {
            anyhow::bail!("deploy.poll_interval_ms must be positive");
        }
        if let Some(entry) = self.contracts.iter().find(|c| c.name.trim().is_empty()) {
            anyhow::bail!(
                "contract with artifact {} has an empty name",
                entry.artifact.display()
            );
        }
        Ok(())
    }

    /// Resolve `path` against the manifest's directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.state_dir)
    }

    /// Load every artifact and build the declared contract specs, in declaration order.
    pub fn contract_specs(&self) -> Result<Vec<ContractSpec>> {
        self.contracts
            .iter()
            .map(|entry| {
                let bytecode = load_bytecode(&self.resolve(&entry.artifact))
                    .with_context(|| format!("Failed to load contract `{}`", entry.name))?;
                Ok(ContractSpec {
                    name: entry.name.clone(),
                    bytecode,
                    args: entry.args.clone(),
                })
            })
            .collect()
    }
}
