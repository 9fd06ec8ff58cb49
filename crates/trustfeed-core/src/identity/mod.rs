//! Identity module for trustfeed
//!
//! Keys, fingerprints and the signing protocol.
//!
//! ## Example
//!
//! ```rust
//! use trustfeed_core::identity::{Ed25519Protocol, Keypair, Protocol};
//! use trustfeed_core::object::Object;
//!
//! let keys = Keypair::from_seed(&[7u8; 32]);
//! let protocol = Ed25519Protocol;
//!
//! let signed = protocol.sign(Object::new("thang").with("a", 1), &keys).unwrap();
//! assert_eq!(protocol.verify(&signed).unwrap(), keys.public_key());
//!
//! let link = protocol.link(&signed).unwrap();
//! println!("link: {}", link);
//! ```

mod keypair;
mod protocol;

pub use keypair::{fingerprint, verify_signature, Keypair};
pub use protocol::{Ed25519Protocol, Protocol};
