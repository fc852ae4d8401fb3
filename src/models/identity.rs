use serde::{Deserialize, Serialize};

/// A resolved user identity as the directory hands it out.
///
/// Key material is looked up separately via `Directory::keypair_for`; the
/// pair is created atomically with first use and never regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub username: String,
}

/// PEM-encoded RSA key pair belonging to one identity.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_pem: String,
    pub public_pem: String,
}
