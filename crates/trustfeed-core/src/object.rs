//! Signed objects, messages and identities
//!
//! Every fact exchanged between nodes is an [`Object`]: a typed JSON body
//! with optional version-chain pointers and a signature. Two kinds have
//! structured bodies:
//!
//! - [`MessageBody`] (`trustfeed.Message`): an envelope carrying another
//!   signed object to one recipient, numbered per sender/recipient pair
//! - [`Identity`] (`trustfeed.Identity`): the public keys of a peer
//!
//! The canonical form of an object is its JSON serialization. `serde_json`
//! maps are ordered, so the encoding is deterministic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{NodeError, NodeResult};
use crate::identity::fingerprint;
use crate::types::{Link, Network, PubKey};

/// Kind of message envelopes
pub const MESSAGE_KIND: &str = "trustfeed.Message";

/// Kind of identity objects
pub const IDENTITY_KIND: &str = "trustfeed.Identity";

/// Key purpose used for signing objects
pub const SIGN_PURPOSE: &str = "sign";

/// Key purpose used as the base key for blockchain seals
pub const SEAL_PURPOSE: &str = "seal";

/// Signature attached to an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Key that produced the signature
    pub pub_key: PubKey,
    /// Hex-encoded 64-byte ed25519 signature
    pub value: String,
}

/// A (possibly signed) object version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Object type, e.g. "trustfeed.Message"
    pub kind: String,
    /// Permalink of the first version (absent on the first version itself)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permalink: Option<Link>,
    /// Link of the previous version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<Link>,
    /// Permalink of the author's identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Link>,
    /// Type-specific fields
    #[serde(default)]
    pub body: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<Signature>,
}

impl Object {
    /// New unsigned first version of the given kind
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            permalink: None,
            prev: None,
            author: None,
            body: Map::new(),
            sig: None,
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    /// Read a body field
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn is_signed(&self) -> bool {
        self.sig.is_some()
    }

    /// Copy of this object without its signature (the bytes that get signed)
    pub fn unsigned(&self) -> Object {
        Object {
            sig: None,
            ..self.clone()
        }
    }

    /// Start the next version of this object, given this version's link.
    pub fn next_version(&self, link: Link) -> Object {
        Object {
            permalink: Some(self.permalink.unwrap_or(link)),
            prev: Some(link),
            sig: None,
            ..self.clone()
        }
    }

    /// Canonical serialization
    pub fn to_bytes(&self) -> NodeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> NodeResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The permalink of this version, given its own link
    pub fn permalink_or(&self, link: Link) -> Link {
        self.permalink.unwrap_or(link)
    }

    pub fn is_message(&self) -> bool {
        self.kind == MESSAGE_KIND
    }
}

/// Public key entry of an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubKeyInfo {
    /// What the key is used for ("sign", "seal", ...)
    pub purpose: String,
    pub pub_key: PubKey,
    /// Hex blake3 of the key
    pub fingerprint: String,
    /// For seal keys, the network they seal on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
}

impl PubKeyInfo {
    pub fn new(purpose: impl Into<String>, pub_key: PubKey) -> Self {
        Self {
            purpose: purpose.into(),
            fingerprint: fingerprint(&pub_key),
            pub_key,
            network: None,
        }
    }

    /// Seal base key for a specific network
    pub fn seal(pub_key: PubKey, network: Network) -> Self {
        Self {
            network: Some(network),
            ..Self::new(SEAL_PURPOSE, pub_key)
        }
    }
}

/// Identity body: the keys a peer signs and seals with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub pub_keys: Vec<PubKeyInfo>,
}

impl Identity {
    pub fn new(name: Option<String>, pub_keys: Vec<PubKeyInfo>) -> Self {
        Self { name, pub_keys }
    }

    /// The signing key, if the identity declares one
    pub fn signing_key(&self) -> Option<&PubKeyInfo> {
        self.pub_keys.iter().find(|k| k.purpose == SIGN_PURPOSE)
    }

    /// Base key for seals on `network`, falling back to the signing key
    pub fn seal_key(&self, network: &Network) -> Option<&PubKeyInfo> {
        self.pub_keys
            .iter()
            .find(|k| k.purpose == SEAL_PURPOSE && k.network.as_ref() == Some(network))
            .or_else(|| self.signing_key())
    }

    /// Whether `pub_key` belongs to this identity
    pub fn has_key(&self, pub_key: &PubKey) -> bool {
        self.pub_keys.iter().any(|k| &k.pub_key == pub_key)
    }

    /// Wrap into an unsigned identity object
    pub fn to_object(&self) -> NodeResult<Object> {
        let body = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => return Err(NodeError::Serialization("identity is not a map".into())),
        };
        Ok(Object {
            body,
            ..Object::new(IDENTITY_KIND)
        })
    }

    /// Parse the identity body of an object
    pub fn from_object(object: &Object) -> NodeResult<Self> {
        if object.kind != IDENTITY_KIND {
            return Err(NodeError::Validation(format!(
                "expected {}, got {}",
                IDENTITY_KIND, object.kind
            )));
        }
        Ok(serde_json::from_value(Value::Object(object.body.clone()))?)
    }
}

/// Body of a message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    /// The signed payload
    pub object: Object,
    /// Key of the recipient this message is addressed to
    pub recipient_pub_key: PubKey,
    /// Position in the sender -> recipient sequence, starting at 0
    pub seq: u32,
    /// Link of the previous message from the same sender to the same recipient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<Link>,
}

impl MessageBody {
    /// Wrap into an unsigned message object
    pub fn to_object(&self) -> NodeResult<Object> {
        let body = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => return Err(NodeError::Serialization("message is not a map".into())),
        };
        Ok(Object {
            body,
            ..Object::new(MESSAGE_KIND)
        })
    }

    /// Parse the body of a message object
    pub fn from_object(object: &Object) -> NodeResult<Self> {
        if !object.is_message() {
            return Err(NodeError::Validation(format!(
                "expected {}, got {}",
                MESSAGE_KIND, object.kind
            )));
        }
        Ok(serde_json::from_value(Value::Object(object.body.clone()))?)
    }
}
