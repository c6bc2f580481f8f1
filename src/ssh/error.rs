// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Transport-level SSH errors.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The host could not be resolved to any usable address.
    #[error("invalid address: {0}")]
    AddressInvalid(#[source] io::Error),

    #[error("connection timed out after {0}s")]
    ConnectTimeout(u64),

    #[error("password authentication rejected")]
    PasswordWrong,

    #[error("public key authentication rejected")]
    KeyAuthFailed,

    /// The private key material could not be decoded.
    #[error("unusable private key: {0}")]
    KeyInvalid(#[source] russh::keys::Error),

    /// The channel closed without reporting an exit status.
    #[error("remote command did not report an exit status")]
    CommandDidntExit,

    /// The post-connect verification command exited non-zero.
    #[error("session verification command exited with status {0}")]
    VerificationFailed(u32),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether another connection attempt could plausibly succeed.
    ///
    /// Credential rejections, undecodable keys, and unresolvable hosts are
    /// deterministic; everything else (timeouts, refused connections,
    /// dropped channels, failed verification) is worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::AddressInvalid(_)
                | Error::PasswordWrong
                | Error::KeyAuthFailed
                | Error::KeyInvalid(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_rejections_are_not_retryable() {
        assert!(!Error::PasswordWrong.is_retryable());
        assert!(!Error::KeyAuthFailed.is_retryable());
        assert!(!Error::AddressInvalid(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no addresses"
        ))
        .is_retryable());
    }

    #[test]
    fn test_transport_failures_are_retryable() {
        assert!(Error::ConnectTimeout(30).is_retryable());
        assert!(Error::CommandDidntExit.is_retryable());
        assert!(Error::VerificationFailed(1).is_retryable());
        assert!(Error::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            .is_retryable());
    }
}
