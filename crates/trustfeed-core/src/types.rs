//! Core types for trustfeed

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::NodeError;

macro_rules! hex_bytes32 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Create from raw bytes
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Lowercase hex representation (64 chars)
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from a 64-char hex string
            pub fn from_hex(s: &str) -> Result<Self, NodeError> {
                let bytes = hex::decode(s)
                    .map_err(|e| NodeError::Serialization(format!("invalid hex: {}", e)))?;
                let arr: [u8; 32] = bytes.try_into().map_err(|_| {
                    NodeError::Serialization(format!("expected 32 bytes in {}", stringify!($name)))
                })?;
                Ok(Self(arr))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({}..)", stringify!($name), &self.to_hex()[..12])
            }
        }

        impl std::str::FromStr for $name {
            type Err = NodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_bytes32!(
    /// Content hash identifying one specific version of an object.
    ///
    /// A permalink is the link of an object's first version, so both share
    /// this type.
    Link
);

hex_bytes32!(
    /// A 32-byte public key (ed25519 signing keys and derived seal keys).
    PubKey
);

/// Stable identifier for an object across all its versions
pub type Permalink = Link;

/// Blockchain + network pair a seal or watch lives on (e.g. bitcoin/testnet).
///
/// Each pair needs its own `BlockchainAdapter`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Network {
    /// Blockchain family, e.g. "bitcoin"
    pub blockchain: String,
    /// Network name within the chain, e.g. "testnet"
    pub name: String,
}

impl Network {
    /// Create a network identifier
    pub fn new(blockchain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            blockchain: blockchain.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.blockchain, self.name)
    }
}

/// Discriminant of a change-log entry.
///
/// Closed set: every reducer matches on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    NewObj,
    ArchiveObj,
    UnarchiveObj,
    AddContact,
    NewWatch,
    QueueSeal,
    WroteSeal,
    ReadSeal,
    Sent,
    SendAborted,
    ForgetObj,
}

impl Topic {
    /// Wire name of the topic
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::NewObj => "newobj",
            Topic::ArchiveObj => "archiveobj",
            Topic::UnarchiveObj => "unarchiveobj",
            Topic::AddContact => "addcontact",
            Topic::NewWatch => "newwatch",
            Topic::QueueSeal => "queueseal",
            Topic::WroteSeal => "wroteseal",
            Topic::ReadSeal => "readseal",
            Topic::Sent => "sent",
            Topic::SendAborted => "sendaborted",
            Topic::ForgetObj => "forgetobj",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seal lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SealStatus {
    Pending,
    Sealed,
}

impl SealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SealStatus::Pending => "pending",
            SealStatus::Sealed => "sealed",
        }
    }
}

/// Outbound message delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Pending,
    Sent,
    Aborted,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Pending => "pending",
            SendStatus::Sent => "sent",
            SendStatus::Aborted => "aborted",
        }
    }
}

/// Which version a watched address attests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchType {
    /// Address is the seal address of the watched link itself
    ThisVersion,
    /// Address is where a successor version's seal will pay its prev output
    NextVersion,
}

/// Current unix time in milliseconds
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
