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

//! Low-level SSH client built on russh.
//!
//! This is the transport the session layer rides on: connect and
//! authenticate, execute commands with a captured exit status, and move
//! bytes over SFTP. Retry, verification, and key-material handling live one
//! level up in [`crate::ssh::session`].

use std::fmt::Debug;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fmt, io};

use russh::client::{Config, Handle, Handler};
use russh_sftp::{client::SftpSession, protocol::OpenFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use zeroize::Zeroizing;

use super::Error;

/// SSH connection timeout. 30 seconds accommodates slow networks and the
/// SSH negotiation itself.
const SSH_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Per-command execution ceiling. Long enough for package installs and
/// compose builds, short enough to detect a truly hung remote.
const COMMAND_TIMEOUT_SECS: u64 = 600;

/// How a session authenticates against the target host.
#[derive(Clone)]
pub enum AuthMethod {
    Password(Zeroizing<String>),
    /// Private key material on disk, typically the session's ephemeral copy.
    KeyFile {
        key_file_path: PathBuf,
        passphrase: Option<Zeroizing<String>>,
    },
}

impl Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("AuthMethod::Password(..)"),
            AuthMethod::KeyFile { key_file_path, .. } => f
                .debug_struct("AuthMethod::KeyFile")
                .field("key_file_path", key_file_path)
                .finish_non_exhaustive(),
        }
    }
}

/// Captured result of one remote command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
}

impl ExecOutput {
    pub fn is_success(&self) -> bool {
        self.exit_status == 0
    }
}

/// An authenticated SSH connection to one remote host.
pub struct Client {
    handle: Handle<ClientHandler>,
    username: String,
    address: SocketAddr,
}

impl Client {
    /// Open a connection and authenticate.
    ///
    /// If the host resolves to multiple addresses, each is attempted in
    /// turn until one connects; authentication is tried on the first
    /// successful transport.
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        auth: AuthMethod,
    ) -> Result<Self, Error> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(Error::AddressInvalid)?
            .collect();
        if addrs.is_empty() {
            return Err(Error::AddressInvalid(io::Error::new(
                io::ErrorKind::InvalidInput,
                "host resolved to no addresses",
            )));
        }

        let config = Arc::new(Config::default());
        let connect_timeout = std::time::Duration::from_secs(SSH_CONNECT_TIMEOUT_SECS);

        let mut last_err: Option<Error> = None;
        let mut connected: Option<(SocketAddr, Handle<ClientHandler>)> = None;
        for addr in addrs {
            let attempt = tokio::time::timeout(
                connect_timeout,
                russh::client::connect(config.clone(), addr, ClientHandler),
            )
            .await;
            match attempt {
                Ok(Ok(handle)) => {
                    connected = Some((addr, handle));
                    break;
                }
                Ok(Err(e)) => last_err = Some(e.into()),
                Err(_) => last_err = Some(Error::ConnectTimeout(SSH_CONNECT_TIMEOUT_SECS)),
            }
        }
        let (address, mut handle) = match connected {
            Some(pair) => pair,
            // last_err is always set here because addrs was non-empty.
            None => return Err(last_err.unwrap_or(Error::ConnectTimeout(SSH_CONNECT_TIMEOUT_SECS))),
        };

        tracing::debug!("transport to {} established, authenticating", address);
        authenticate(&mut handle, username, auth).await?;

        Ok(Self {
            handle,
            username: username.to_string(),
            address,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Execute a remote command and collect stdout, stderr, and exit status.
    ///
    /// Every invocation runs in a fresh shell context. When `pty` is set a
    /// pseudo-terminal is allocated first, which some elevation setups
    /// require. `stdin` is written to the command's standard input and the
    /// stream closed; it never appears on the remote command line.
    pub async fn execute(
        &self,
        command: &str,
        pty: bool,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, Error> {
        let timeout = std::time::Duration::from_secs(COMMAND_TIMEOUT_SECS);
        tokio::time::timeout(timeout, self.execute_inner(command, pty, stdin))
            .await
            .map_err(|_| Error::ConnectTimeout(COMMAND_TIMEOUT_SECS))?
    }

    async fn execute_inner(
        &self,
        command: &str,
        pty: bool,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, Error> {
        let mut channel = self.handle.channel_open_session().await?;
        if pty {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await?;
        }
        channel.exec(true, command).await?;
        if let Some(input) = stdin {
            channel.data(input).await?;
            channel.eof().await?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status: Option<u32> = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                russh::ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                russh::ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                // The exit status can arrive before the last data message,
                // so keep draining the channel after it.
                russh::ChannelMsg::ExitStatus { exit_status: s } => exit_status = Some(s),
                _ => {}
            }
        }

        match exit_status {
            Some(exit_status) => Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&stdout).to_string(),
                stderr: String::from_utf8_lossy(&stderr).to_string(),
                exit_status,
            }),
            None => Err(Error::CommandDidntExit),
        }
    }

    /// Write a byte buffer to a remote path over SFTP, truncating any
    /// existing file.
    pub async fn write_remote(&self, remote_path: &str, contents: &[u8]) -> Result<(), Error> {
        let sftp = self.sftp_session().await?;
        let mut file = sftp
            .open_with_flags(
                remote_path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await?;
        file.write_all(contents).await?;
        file.flush().await?;
        file.shutdown().await?;
        Ok(())
    }

    /// Read a remote file's contents over SFTP.
    pub async fn read_remote(&self, remote_path: &str) -> Result<Vec<u8>, Error> {
        let sftp = self.sftp_session().await?;
        let mut file = sftp.open_with_flags(remote_path, OpenFlags::READ).await?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).await?;
        Ok(contents)
    }

    /// Upload a local file to the remote host over SFTP.
    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<(), Error> {
        let contents = tokio::fs::read(local_path).await?;
        self.write_remote(remote_path, &contents).await
    }

    /// Disconnect from the remote host.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
            .map_err(Error::Ssh)
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn sftp_session(&self) -> Result<SftpSession, Error> {
        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        Ok(SftpSession::new(channel.into_stream()).await?)
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("username", &self.username)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Handler for the russh client side.
///
/// Provisioning targets are typically freshly created hosts whose keys are
/// not yet known anywhere, so the server key is accepted and logged rather
/// than checked against a known-hosts file.
#[derive(Debug, Clone)]
struct ClientHandler;

impl Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "accepting server key of type {}",
            server_public_key.algorithm()
        );
        Ok(true)
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    auth: AuthMethod,
) -> Result<(), Error> {
    match auth {
        AuthMethod::Password(password) => {
            let result = handle.authenticate_password(username, &**password).await?;
            if !result.success() {
                return Err(Error::PasswordWrong);
            }
        }
        AuthMethod::KeyFile {
            key_file_path,
            passphrase,
        } => {
            let key =
                russh::keys::load_secret_key(key_file_path, passphrase.as_ref().map(|p| &***p))
                    .map_err(Error::KeyInvalid)?;
            let result = handle
                .authenticate_publickey(
                    username,
                    russh::keys::PrivateKeyWithHashAlg::new(
                        Arc::new(key),
                        handle.best_supported_rsa_hash().await?.flatten(),
                    ),
                )
                .await?;
            if !result.success() {
                return Err(Error::KeyAuthFailed);
            }
        }
    }
    Ok(())
}
