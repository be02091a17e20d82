//! Compiled contract artifacts.
//!
//! Accepts the JSON artifacts written by the common Solidity toolchains as well as plain hex
//! files:
//!
//! - truffle / hardhat: `{ "bytecode": "0x..." }`
//! - foundry: `{ "bytecode": { "object": "0x..." } }`
//! - anything else: the file content is the hex bytecode itself.

use std::path::Path;

use alloy_core::primitives::Bytes;
use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum ArtifactBytecode {
    Plain(String),
    Foundry { object: String },
}

#[derive(Deserialize)]
struct Artifact {
    bytecode: ArtifactBytecode,
}

/// Read the creation bytecode stored at `path`.
pub fn load_bytecode(path: &Path) -> Result<Bytes> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read artifact {}", path.display()))?;

    let hex_code = if content.trim_start().starts_with('{') {
        let artifact: Artifact = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact {}", path.display()))?;
        match artifact.bytecode {
            ArtifactBytecode::Plain(code) | ArtifactBytecode::Foundry { object: code } => code,
        }
    } else {
        content
    };

    parse_bytecode(hex_code.trim())
        .with_context(|| format!("Invalid bytecode in artifact {}", path.display()))
}

fn parse_bytecode(hex_code: &str) -> Result<Bytes> {
    let digits = hex_code.strip_prefix("0x").unwrap_or(hex_code);

    // Unlinked library placeholders look like `__$<hash>$__`.
    if digits.contains("__") {
        anyhow::bail!("bytecode contains unlinked library placeholders");
    }
    if digits.is_empty() {
        anyhow::bail!("bytecode is empty (abstract contract or interface?)");
    }

    let bytes = hex::decode(digits).context("bytecode is not valid hex")?;
    Ok(Bytes::from(bytes))
}
