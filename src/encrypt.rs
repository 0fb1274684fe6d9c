//! Pluggable per-connection encryption.
//!
//! The handshake that negotiates an encryptor for a connection is out of
//! scope for this crate; this module only defines the contract the
//! send/receive pipelines call through, plus [`NullEncryptor`], the identity
//! implementation used when a connection negotiates no encryption at all.

/// Encrypts and decrypts the payload of reliable/unreliable data packets in place.
/// Core/Resync/Ack/Cluster/ping/time-sync packets are never encrypted: they are
/// processed ahead of the encryption layer.
pub trait Encryptor: Send {
    /// Encrypts `data` in place, returning the new length (implementations may
    /// need to pad).
    fn encrypt(&self, data: &mut Vec<u8>);

    /// Decrypts `data` in place. Returns `false` if the payload is malformed
    /// and the packet should be dropped.
    fn decrypt(&self, data: &mut Vec<u8>) -> bool;

    /// True if this encryptor performs no transformation, letting the send
    /// pipeline skip the call entirely on the hot path.
    fn is_void(&self) -> bool {
        false
    }
}

/// The identity encryptor: no transformation, always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEncryptor;

impl Encryptor for NullEncryptor {
    fn encrypt(&self, _data: &mut Vec<u8>) {}

    fn decrypt(&self, _data: &mut Vec<u8>) -> bool {
        true
    }

    fn is_void(&self) -> bool {
        true
    }
}
