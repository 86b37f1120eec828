//! Secure Channel: TLS 1.3 to remote daemons
//!
//! Two ways in:
//! - **Pinned**: the server certificate must be byte-identical to the one
//!   recorded at pairing time. Used for control and tunnel connections.
//! - **Unverified**: any server certificate is accepted and captured so the
//!   pairing handshake can authenticate it out-of-band. Only the pairing
//!   protocol may use this mode.
//!
//! Both present the local identity as a client certificate and expose a
//! channel-binding value exported from the TLS session.

mod tls;
mod verifier;

pub use tls::{
    received_alert, AsyncStream, BoxedStream, ChannelConnector, ChannelError, SecureChannel,
    UnverifiedChannel, CHANNEL_BINDING_LABEL, CHANNEL_BINDING_LEN,
};
