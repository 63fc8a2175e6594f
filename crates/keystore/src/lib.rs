//! InferMesh Keystore
//!
//! Node identity and path utilities shared by the InferMesh binaries.
//!
//! ## Features
//!
//! - libp2p Ed25519 identity, generated on first use and persisted
//! - Config directory resolution (`$INFERMESH_HOME`, else `~/.infermesh`)
//! - Path expansion for `~` and `$VAR` components

mod keypair;
mod paths;

pub use keypair::{default_key_path, load_or_generate_libp2p_keypair, KeystoreError};
pub use paths::{default_config_dir, expand_path};

pub type Result<T> = std::result::Result<T, KeystoreError>;
