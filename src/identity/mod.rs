//! Identity: key material and pinned peer certificates
//!
//! Every remote host gets its own Ed25519 identity (keypair plus a
//! self-signed certificate carrying this engine's instance UUID) and,
//! once paired, a pinned copy of the remote daemon's certificate.
//! Everything lives under a per-`(context, host)` directory.

mod store;

pub use store::{
    fingerprint, short_fingerprint, validate_context, validate_host, Identity, KeyStore,
    KeyStoreError,
};
