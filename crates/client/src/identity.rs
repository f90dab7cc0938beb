//! Locally held device identity.
//!
//! An ed25519 key pair that signs handshake nonces. Key persistence is the
//! surrounding application's concern; the core accepts the seed as opaque
//! input and never writes it anywhere.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use sha2::{Digest, Sha256};

use tether_protocol::DeviceInfo;

pub struct DeviceIdentity {
    signing: SigningKey,
}

impl DeviceIdentity {
    /// Fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Stable device id: hex SHA-256 fingerprint of the public key.
    #[must_use]
    pub fn id(&self) -> String {
        let digest = Sha256::digest(self.signing.verifying_key().as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[must_use]
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.signing.verifying_key().as_bytes())
    }

    /// Build the handshake device block for a challenge nonce.
    ///
    /// The signed payload is `nonce|signedAt|clientId` so a replayed
    /// signature is bound to both the challenge and the presenting client.
    #[must_use]
    pub fn sign_challenge(&self, nonce: &str, client_id: &str) -> DeviceInfo {
        let signed_at = unix_ms();
        let payload = format!("{nonce}|{signed_at}|{client_id}");
        let signature = self.signing.sign(payload.as_bytes());
        DeviceInfo {
            id: self.id(),
            public_key: Some(self.public_key_b64()),
            signature: Some(BASE64.encode(signature.to_bytes())),
            signed_at: Some(signed_at),
            nonce: Some(nonce.to_string()),
        }
    }

    /// Token-only device block, used when no challenge nonce was supplied.
    #[must_use]
    pub fn bare_info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id(),
            public_key: Some(self.public_key_b64()),
            signature: None,
            signed_at: None,
            nonce: None,
        }
    }
}

fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
