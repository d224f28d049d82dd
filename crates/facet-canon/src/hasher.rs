use facet_types::RdpId;
use serde_json::Value;

use crate::json::canonical_json;

/// Domain-separated BLAKE3 hasher over canonical JSON.
///
/// Each hasher carries a domain tag that is prepended to every computation,
/// so a single derived property and a derived-property set with identical
/// bytes never collide.
pub struct CanonicalHasher {
    domain: &'static str,
}

impl CanonicalHasher {
    /// Hasher for one named derived property.
    pub const RDP: Self = Self {
        domain: "facet-rdp-v1",
    };
    /// Hasher for a derived-property request set.
    pub const RDP_SET: Self = Self {
        domain: "facet-rdp-set-v1",
    };

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        *hasher.finalize().as_bytes()
    }

    /// Hash a JSON value in canonical (key-sorted) form.
    pub fn hash_json(&self, value: &Value) -> [u8; 32] {
        self.hash(canonical_json(value).as_bytes())
    }

    /// Hash a JSON value and format it as an [`RdpId`].
    pub fn rdp_id(&self, value: &Value) -> RdpId {
        RdpId::from_digest(&self.hash_json(value))
    }

    /// Hex digest of a JSON value, truncated to `len` characters.
    pub fn short_hex(&self, value: &Value, len: usize) -> String {
        let full = hex::encode(self.hash_json(value));
        full[..len.min(full.len())].to_string()
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }
}
