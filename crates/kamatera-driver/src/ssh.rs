//! Key-pair generation and the one-time password SSH session that installs
//! the machine's public key on a fresh server.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use tokio::process::Command;
use tracing::{debug, info};

use crate::{Error, Result};

/// Creates the SSH key pair the orchestration tool will use for the machine.
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Ensure a key pair exists at `private_key_path` and return the public
    /// key line.
    async fn generate(&self, private_key_path: &Path) -> Result<String>;
}

/// Shells out to `ssh-keygen -t rsa -b 2048`.
#[derive(Debug, Clone, Default)]
pub struct SshKeygen;

fn public_key_path(private_key_path: &Path) -> PathBuf {
    let mut path = private_key_path.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(&self, private_key_path: &Path) -> Result<String> {
        let pub_path = public_key_path(private_key_path);

        // A resumed create reuses the pair written by the interrupted run.
        if tokio::fs::try_exists(private_key_path).await? && tokio::fs::try_exists(&pub_path).await? {
            debug!(path = %private_key_path.display(), "reusing existing ssh key");
            return read_public_key(&pub_path).await;
        }

        if let Some(dir) = private_key_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let output = Command::new("ssh-keygen")
            .args(["-t", "rsa", "-b", "2048", "-N", "", "-q", "-f"])
            .arg(private_key_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::KeyGeneration(format!("failed to run ssh-keygen: {e}")))?;

        if !output.status.success() {
            return Err(Error::KeyGeneration(format!(
                "ssh-keygen exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!(path = %private_key_path.display(), "generated ssh key pair");
        read_public_key(&pub_path).await
    }
}

async fn read_public_key(path: &Path) -> Result<String> {
    let key = tokio::fs::read_to_string(path).await?;
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::KeyGeneration(format!("{} is empty", path.display())));
    }
    Ok(key.to_string())
}

/// The remote command that appends `public_key` to root's authorized keys.
pub fn authorized_keys_command(public_key: &str) -> String {
    format!(
        "bash -c 'mkdir -p .ssh && echo \"{}\" >> .ssh/authorized_keys'",
        public_key.trim()
    )
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Could not connect, authenticate or open a session. The guest may
    /// still be booting, so callers retry.
    #[error("connect: {0}")]
    Connect(String),

    /// The session was up but the key installation itself failed.
    #[error("remote command: {0}")]
    Remote(String),
}

/// Installs a public key over a password-authenticated SSH session.
#[async_trait]
pub trait SshBootstrapper: Send + Sync {
    async fn install_key(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        public_key: &str,
    ) -> std::result::Result<(), BootstrapError>;
}

/// [`SshBootstrapper`] backed by `russh`. The server's host key is not
/// verified: the server was created moments ago and its key is unknown.
#[derive(Debug, Clone)]
pub struct RusshBootstrapper {
    connect_timeout: Duration,
}

impl RusshBootstrapper {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

#[async_trait]
impl SshBootstrapper for RusshBootstrapper {
    async fn install_key(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        public_key: &str,
    ) -> std::result::Result<(), BootstrapError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        });

        let mut session = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, (host, port), AcceptAnyHostKey),
        )
        .await
        .map_err(|_| BootstrapError::Connect(format!("timed out after {:?}", self.connect_timeout)))?
        .map_err(|e| BootstrapError::Connect(e.to_string()))?;

        let authenticated = session
            .authenticate_password(user, password)
            .await
            .map_err(|e| BootstrapError::Connect(e.to_string()))?;
        if !authenticated {
            return Err(BootstrapError::Connect(format!(
                "password authentication rejected for {user}@{host}"
            )));
        }

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| BootstrapError::Connect(e.to_string()))?;

        channel
            .exec(true, authorized_keys_command(public_key))
            .await
            .map_err(|e| BootstrapError::Remote(e.to_string()))?;

        let mut exit_status = None;
        let mut stderr = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::ExtendedData { data, .. } => stderr.extend_from_slice(&data),
                ChannelMsg::Failure => {
                    return Err(BootstrapError::Remote("exec request refused".into()));
                }
                _ => {}
            }
        }

        let _ = session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;

        match exit_status {
            Some(0) => Ok(()),
            Some(code) => Err(BootstrapError::Remote(format!(
                "exited with status {code}: {}",
                String::from_utf8_lossy(&stderr).trim()
            ))),
            None => Err(BootstrapError::Remote(
                "channel closed without an exit status".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_appends_key_to_authorized_keys() {
        let cmd = authorized_keys_command("ssh-rsa AAAAB3Nza user@host\n");
        assert_eq!(
            cmd,
            "bash -c 'mkdir -p .ssh && echo \"ssh-rsa AAAAB3Nza user@host\" >> .ssh/authorized_keys'"
        );
    }

    #[test]
    fn public_key_sits_next_to_private_key() {
        assert_eq!(
            public_key_path(Path::new("/store/machines/web/id_rsa")),
            PathBuf::from("/store/machines/web/id_rsa.pub")
        );
    }

    #[tokio::test]
    async fn existing_pair_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("id_rsa");
        std::fs::write(&private, "PRIVATE").unwrap();
        std::fs::write(dir.path().join("id_rsa.pub"), "ssh-rsa AAAA existing\n").unwrap();

        let key = SshKeygen.generate(&private).await.unwrap();
        assert_eq!(key, "ssh-rsa AAAA existing");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_connect_error() {
        let err = RusshBootstrapper::new(Duration::from_millis(500))
            .install_key("127.0.0.1", 1, "root", "pw", "ssh-rsa AAAA")
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Connect(_)));
    }
}
