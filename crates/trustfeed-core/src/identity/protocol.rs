//! Signing, verification and content addressing
//!
//! The node treats the trust protocol as an opaque service behind the
//! [`Protocol`] trait. [`Ed25519Protocol`] is the default implementation:
//! ed25519 signatures over the canonical JSON of the unsigned object, blake3
//! links over the signed object, and blake3-derived seal keys.

use crate::error::{NodeError, NodeResult};
use crate::identity::keypair::{verify_signature, Keypair};
use crate::object::{Object, Signature};
use crate::types::{Link, PubKey};

const SEAL_CONTEXT: &str = "trustfeed 2024 seal key";
const SEAL_PREV_CONTEXT: &str = "trustfeed 2024 seal prev key";

/// Sign / verify / link service
pub trait Protocol: Send + Sync {
    /// Sign `object` with `keys`, replacing any existing signature
    fn sign(&self, object: Object, keys: &Keypair) -> NodeResult<Object>;

    /// Check the signature and return the key that made it
    fn verify(&self, object: &Object) -> NodeResult<PubKey>;

    /// Content hash of the object as it is (signed or not)
    fn link(&self, object: &Object) -> NodeResult<Link>;

    /// Key whose address a seal of `link` pays to
    fn seal_pub_key(&self, link: &Link, base: &PubKey) -> PubKey;

    /// Key whose address a seal of the version *after* `prev_link` pays to
    fn seal_prev_pub_key(&self, prev_link: &Link, base: &PubKey) -> PubKey;
}

/// Default [`Protocol`] implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Protocol;

impl Ed25519Protocol {
    fn derive(context: &str, link: &Link, base: &PubKey) -> PubKey {
        let mut hasher = blake3::Hasher::new_derive_key(context);
        hasher.update(base.as_bytes());
        hasher.update(link.as_bytes());
        PubKey::from_bytes(*hasher.finalize().as_bytes())
    }
}

impl Protocol for Ed25519Protocol {
    fn sign(&self, object: Object, keys: &Keypair) -> NodeResult<Object> {
        let mut object = object.unsigned();
        let bytes = object.to_bytes()?;
        let sig = keys.sign(&bytes);
        object.sig = Some(Signature {
            pub_key: keys.public_key(),
            value: hex::encode(sig),
        });
        Ok(object)
    }

    fn verify(&self, object: &Object) -> NodeResult<PubKey> {
        let sig = object
            .sig
            .as_ref()
            .ok_or_else(|| NodeError::InvalidSignature("object is not signed".to_string()))?;
        let sig_bytes = hex::decode(&sig.value)
            .map_err(|e| NodeError::InvalidSignature(format!("signature is not hex: {}", e)))?;
        let bytes = object.unsigned().to_bytes()?;
        verify_signature(&sig.pub_key, &bytes, &sig_bytes)?;
        Ok(sig.pub_key)
    }

    fn link(&self, object: &Object) -> NodeResult<Link> {
        let bytes = object.to_bytes()?;
        Ok(Link::from_bytes(*blake3::hash(&bytes).as_bytes()))
    }

    fn seal_pub_key(&self, link: &Link, base: &PubKey) -> PubKey {
        Self::derive(SEAL_CONTEXT, link, base)
    }

    fn seal_prev_pub_key(&self, prev_link: &Link, base: &PubKey) -> PubKey {
        Self::derive(SEAL_PREV_CONTEXT, prev_link, base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let protocol = Ed25519Protocol;
        let keys = Keypair::from_seed(&[1u8; 32]);
        let signed = protocol
            .sign(Object::new("thang").with("a", 1), &keys)
            .unwrap();
        assert_eq!(protocol.verify(&signed).unwrap(), keys.public_key());
    }

    #[test]
    fn test_tampered_object_fails_verification() {
        let protocol = Ed25519Protocol;
        let keys = Keypair::from_seed(&[1u8; 32]);
        let mut signed = protocol
            .sign(Object::new("thang").with("a", 1), &keys)
            .unwrap();
        signed.body.insert("a".into(), 2.into());
        assert!(matches!(
            protocol.verify(&signed),
            Err(NodeError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_unsigned_object_fails_verification() {
        assert!(Ed25519Protocol.verify(&Object::new("thang")).is_err());
    }

    #[test]
    fn test_link_depends_on_signature() {
        let protocol = Ed25519Protocol;
        let object = Object::new("thang").with("a", 1);
        let a = protocol
            .sign(object.clone(), &Keypair::from_seed(&[1u8; 32]))
            .unwrap();
        let b = protocol
            .sign(object, &Keypair::from_seed(&[2u8; 32]))
            .unwrap();
        assert_ne!(protocol.link(&a).unwrap(), protocol.link(&b).unwrap());
    }

    #[test]
    fn test_seal_keys_are_domain_separated() {
        let protocol = Ed25519Protocol;
        let link = Link::from_bytes([5u8; 32]);
        let base = PubKey::from_bytes([6u8; 32]);
        assert_ne!(
            protocol.seal_pub_key(&link, &base),
            protocol.seal_prev_pub_key(&link, &base)
        );
        assert_eq!(
            protocol.seal_pub_key(&link, &base),
            protocol.seal_pub_key(&link, &base)
        );
    }
}
