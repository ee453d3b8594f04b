//! AUTH_UNIX credentials (RFC 5531 appendix A).
//!
//! Every call carries the caller's identity as an `opaque_auth` of flavor
//! AUTH_UNIX whose body is the XDR encoding of:
//!
//! ```text
//! stamp        (4)
//! name length  (4) + name bytes padded to 4
//! uid          (4)
//! gid          (4)
//! group count  (4) + one 4-byte gid per group
//! ```
//!
//! The verifier is always AUTH_NONE with an empty body. Encoding a credential
//! is not free, so the engine keeps the last one in a [`CredentialCache`] and
//! reuses it until the identity changes.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::trace;

use super::error::AuthError;
use crate::protocol::xdr::rpc::{
    auth_flavor, auth_unix, opaque_auth, MAX_AUTH_GROUPS, MAX_MACHINE_NAME_LEN,
};
use crate::protocol::xdr::utils::padding_len;
use crate::protocol::xdr::Serialize;

/// Identity presented to the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AuthUnix {
    /// Name of the calling machine
    pub machine_name: String,
    /// Effective user id
    pub uid: u32,
    /// Effective group id
    pub gid: u32,
    /// Supplementary group ids, at most 16
    pub groups: Vec<u32>,
}

impl AuthUnix {
    pub fn new(machine_name: impl Into<String>, uid: u32, gid: u32, groups: Vec<u32>) -> Self {
        Self { machine_name: machine_name.into(), uid, gid, groups }
    }

    /// Size of the encoded credential body in bytes.
    pub fn encoded_len(&self) -> usize {
        let name = self.machine_name.len();
        4 + 4 + name + padding_len(name) + 4 + 4 + 4 + 4 * self.groups.len()
    }

    /// Encodes the credential body with the given stamp.
    ///
    /// Fails when the machine name or the group list does not fit the limits
    /// of the `auth_unix` structure.
    pub fn encode(&self, stamp: u32) -> Result<Vec<u8>, AuthError> {
        if self.machine_name.len() > MAX_MACHINE_NAME_LEN {
            return Err(AuthError::MachineNameTooLong(self.machine_name.len()));
        }
        if self.groups.len() > MAX_AUTH_GROUPS {
            return Err(AuthError::TooManyGroups(self.groups.len()));
        }

        let body = auth_unix {
            stamp,
            machinename: self.machine_name.as_bytes().to_vec(),
            uid: self.uid,
            gid: self.gid,
            gids: self.groups.clone(),
        };
        let mut buf = Vec::with_capacity(self.encoded_len());
        body.serialize(&mut buf).map_err(|e| AuthError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Wraps the encoded body into an AUTH_UNIX `opaque_auth`.
    pub fn credential(&self, stamp: u32) -> Result<opaque_auth, AuthError> {
        Ok(opaque_auth { flavor: auth_flavor::AUTH_UNIX, body: self.encode(stamp)? })
    }
}

/// Seconds since the epoch, truncated to 32 bits, used as the AUTH_UNIX stamp.
pub(crate) fn current_stamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Holds the encoded credential of the most recently used identity.
#[derive(Debug, Default)]
pub struct CredentialCache {
    cached: Option<(AuthUnix, opaque_auth)>,
    builds: u64,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the credential for `identity`, encoding it only if it differs
    /// from the cached one.
    pub fn get(&mut self, identity: &AuthUnix) -> Result<opaque_auth, AuthError> {
        if let Some((cached_identity, credential)) = &self.cached {
            if cached_identity == identity {
                return Ok(credential.clone());
            }
        }

        let credential = identity.credential(current_stamp())?;
        self.builds += 1;
        trace!(
            "built AUTH_UNIX credential for {}:{}/{} ({} bytes)",
            identity.machine_name,
            identity.uid,
            identity.gid,
            credential.body.len()
        );
        self.cached = Some((identity.clone(), credential.clone()));
        Ok(credential)
    }

    /// How many times a credential had to be encoded.
    pub fn builds(&self) -> u64 {
        self.builds
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}
