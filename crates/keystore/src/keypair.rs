use std::path::{Path, PathBuf};

use libp2p::identity::Keypair;
use thiserror::Error;
use tracing::info;

use crate::{default_config_dir, expand_path, Result};

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Failed to read keyfile {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write keyfile {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid keyfile {path}: {reason}")]
    InvalidKey { path: PathBuf, reason: String },
}

/// `<config dir>/node.key`
pub fn default_key_path() -> PathBuf {
    default_config_dir().join("node.key")
}

/// Load the node identity from `path`, generating and saving a fresh
/// Ed25519 keypair when the file does not exist.
///
/// Keys are stored in libp2p's protobuf encoding.
pub fn load_or_generate_libp2p_keypair(path: &Path) -> Result<Keypair> {
    let path = expand_path(path);

    if path.exists() {
        let bytes = std::fs::read(&path).map_err(|source| KeystoreError::Read {
            path: path.clone(),
            source,
        })?;
        let keypair =
            Keypair::from_protobuf_encoding(&bytes).map_err(|e| KeystoreError::InvalidKey {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        info!("Loaded node identity from {:?}", path);
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| KeystoreError::InvalidKey {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    write_private(&path, &bytes)?;
    info!("Generated new node identity at {:?}", path);
    Ok(keypair)
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    let write_err = |source| KeystoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
    }
    std::fs::write(path, bytes).map_err(write_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(write_err)?;
    }
    Ok(())
}
