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

//! System-level operations: package management, user provisioning, TLS
//! bootstrap, and host diagnostics. Debian/Ubuntu targets.

use serde_json::json;

use crate::error::Result;
use crate::executor::{
    shell_single_quote, EntryStatus, HistoryEntry, RemoteChannel, RunOptions, TaskExecutor,
    TaskGroup,
};

/// OpenSSL request config template for SAN-bearing certificates. The
/// placeholder is substituted with the host address before upload.
const OPENSSL_SAN_TEMPLATE: &str = "\
[req]
distinguished_name = req_distinguished_name
req_extensions = req_ext
prompt = no

[req_distinguished_name]
CN = <MY_IP>

[req_ext]
subjectAltName = @alt_names

[alt_names]
IP.1 = <MY_IP>
";

/// Apt waits this long (seconds) for the dpkg lock instead of failing fast.
const DPKG_LOCK_TIMEOUT_SECS: u32 = 300;

/// Options for [`TaskExecutor::add_user`].
#[derive(Debug, Default, Clone)]
pub struct AddUserOptions {
    /// Create the home directory (`useradd -m`).
    pub with_home_dir: bool,
    /// Add the new user to the `sudo` group.
    pub sudoer: bool,
    /// Drop a NOPASSWD sudoers rule for the user. Reduced-security debug
    /// convenience; logged loudly.
    pub passwordless_sudo: bool,
}

impl<C: RemoteChannel> TaskExecutor<C> {
    /// Install packages via apt, recovering a stale dpkg lock first.
    pub async fn apt_install(&mut self, packages: &str) -> Result<Option<String>> {
        self.apt(&format!("install -y {packages}"), json!({ "packages": packages }))
            .await
    }

    /// Upgrade all installed packages via apt.
    pub async fn apt_upgrade(&mut self) -> Result<Option<String>> {
        self.apt("upgrade -y", json!({ "upgrade": true })).await
    }

    async fn apt(
        &mut self,
        subcommand: &str,
        detail: serde_json::Value,
    ) -> Result<Option<String>> {
        // An interrupted earlier run can leave dpkg half-configured; this is
        // a no-op otherwise.
        self.run(
            TaskGroup::SystemPackages,
            "dpkg --configure -a",
            RunOptions::elevated().describe("recover interrupted dpkg state"),
        )
        .await?;

        let command =
            format!("apt-get -o DPkg::Lock::Timeout={DPKG_LOCK_TIMEOUT_SECS} {subcommand}");
        let result = self
            .run(
                TaskGroup::SystemPackages,
                &command,
                RunOptions::elevated(),
            )
            .await?;

        let mut entry = HistoryEntry::new("apt", EntryStatus::Success).command(command);
        if let Some(output) = &result {
            entry = entry.output(output.clone());
        }
        if let serde_json::Value::Object(map) = detail {
            entry = entry.metadata(map);
        }
        self.record(entry);
        Ok(result)
    }

    /// Create a user account, hashing the password remotely via openssl.
    pub async fn add_user(
        &mut self,
        user_name: &str,
        password: &str,
        options: AddUserOptions,
    ) -> Result<Option<String>> {
        let home_flag = if options.with_home_dir { "-m " } else { "" };
        let command = format!(
            "useradd -p \"$(openssl passwd {})\" {home_flag}-d /home/{user_name} {user_name}",
            shell_single_quote(password)
        );
        let result = self
            .run(TaskGroup::UserAccess, &command, RunOptions::elevated())
            .await?;

        if options.sudoer {
            self.run(
                TaskGroup::UserAccess,
                &format!("usermod -aG sudo {user_name}"),
                RunOptions::elevated(),
            )
            .await?;

            if options.passwordless_sudo {
                tracing::warn!(
                    "granting passwordless sudo to {user_name}: reduced-security debug mode"
                );
                let sudoers_path = format!("/etc/sudoers.d/90-orchestration-{user_name}");
                self.run(
                    TaskGroup::UserAccess,
                    &format!(
                        "echo '{user_name} ALL=(ALL) NOPASSWD: ALL' | tee {sudoers_path}"
                    ),
                    RunOptions::elevated(),
                )
                .await?;
                self.run(
                    TaskGroup::UserAccess,
                    &format!("chmod 440 {sudoers_path}"),
                    RunOptions::elevated(),
                )
                .await?;
            }
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert("user_name".into(), user_name.into());
        metadata.insert("with_home_dir".into(), options.with_home_dir.into());
        metadata.insert("sudoer".into(), options.sudoer.into());
        metadata.insert(
            "passwordless_sudo".into(),
            options.passwordless_sudo.into(),
        );
        self.record(
            HistoryEntry::new("add_user", EntryStatus::Success)
                .command(format!("useradd {home_flag}-d /home/{user_name} {user_name}"))
                .metadata(metadata),
        );
        Ok(result)
    }

    /// Numeric uid of the login user.
    pub async fn user_id(&mut self) -> Result<Option<String>> {
        self.run(TaskGroup::UserAccess, "id -u", RunOptions::new())
            .await
    }

    /// Account names owning a directory under /home.
    pub async fn list_users(&mut self) -> Result<Option<String>> {
        self.run(
            TaskGroup::UserAccess,
            "ls -l /home | awk '{print $4}'",
            RunOptions::new(),
        )
        .await
    }

    /// Percent of the root filesystem in use. Diagnostic: degrades to 0
    /// with a warning when the target is not recognizably Linux or the
    /// output cannot be parsed.
    pub async fn disk_free(&mut self) -> Result<u8> {
        let uname = self
            .run(TaskGroup::Networking, "uname -s", RunOptions::new())
            .await?
            .unwrap_or_default();
        if !uname.contains("Linux") {
            tracing::warn!("no idea how to get disk usage on {uname:?}");
            self.record(
                HistoryEntry::new("disk_free", EntryStatus::Error).output(uname),
            );
            return Ok(0);
        }

        let percent = self
            .run(
                TaskGroup::Networking,
                "df -h / | tail -n1 | awk '{print $5}'",
                RunOptions::new(),
            )
            .await?
            .unwrap_or_default();
        let value = percent
            .trim()
            .trim_end_matches('%')
            .parse::<u8>()
            .unwrap_or_else(|_| {
                tracing::warn!("unparseable df output: {percent:?}");
                0
            });
        self.record(
            HistoryEntry::new("disk_free", EntryStatus::Success).output(value.to_string()),
        );
        Ok(value)
    }

    /// Create a private key and SAN-bearing self-signed certificate under
    /// `path`, keyed to `ip`. The key ends up mode 600, the cert 644.
    pub async fn tls_setup(&mut self, ip: &str, path: &str) -> Result<()> {
        self.create_dir(path).await?;

        let config = OPENSSL_SAN_TEMPLATE.replace("<MY_IP>", ip);
        self.write_file(&format!("{path}/openssl-san.cnf"), config.as_bytes(), false)
            .await?;

        self.run(
            TaskGroup::SecurityAssets,
            &format!("cd {path}; openssl genrsa -out key.pem 2048"),
            RunOptions::new(),
        )
        .await?;
        self.run(
            TaskGroup::SecurityAssets,
            &format!(
                "cd {path}; openssl req -new -key key.pem -out server.csr -config openssl-san.cnf"
            ),
            RunOptions::new(),
        )
        .await?;
        self.run(
            TaskGroup::SecurityAssets,
            &format!(
                "cd {path}; openssl x509 -req -in server.csr -signkey key.pem \
                 -out cert.pem -days 365 -extensions req_ext -extfile openssl-san.cnf"
            ),
            RunOptions::new(),
        )
        .await?;
        self.restrict_tls_permissions(path).await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("ip".into(), ip.into());
        metadata.insert("path".into(), path.into());
        self.record(HistoryEntry::new("tls_setup", EntryStatus::Success).metadata(metadata));
        Ok(())
    }

    /// Minimal TLS bootstrap: self-signed certificate with an inline
    /// subject, no SAN config.
    pub async fn tls_setup_self_signed(&mut self, ip: &str, path: &str) -> Result<()> {
        self.create_dir(path).await?;

        self.run(
            TaskGroup::SecurityAssets,
            &format!("cd {path}; openssl genrsa -out key.pem 2048"),
            RunOptions::new(),
        )
        .await?;
        self.run(
            TaskGroup::SecurityAssets,
            &format!(
                "cd {path}; openssl req -new -key key.pem -out server.csr -subj '/CN={ip}'"
            ),
            RunOptions::new(),
        )
        .await?;
        self.run(
            TaskGroup::SecurityAssets,
            &format!(
                "cd {path}; openssl x509 -req -in server.csr -signkey key.pem \
                 -out cert.pem -days 365"
            ),
            RunOptions::new(),
        )
        .await?;
        self.restrict_tls_permissions(path).await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("ip".into(), ip.into());
        metadata.insert("path".into(), path.into());
        self.record(
            HistoryEntry::new("tls_setup_self_signed", EntryStatus::Success).metadata(metadata),
        );
        Ok(())
    }

    async fn restrict_tls_permissions(&mut self, path: &str) -> Result<()> {
        self.run(
            TaskGroup::SecurityAssets,
            &format!("chmod 600 {path}/key.pem"),
            RunOptions::new(),
        )
        .await?;
        self.run(
            TaskGroup::SecurityAssets,
            &format!("chmod 644 {path}/cert.pem"),
            RunOptions::new(),
        )
        .await?;
        Ok(())
    }
}
