use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxOptions;

pub const DEFAULT_PORT: u16 = 1230;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("secret file {0} is empty")]
    EmptySecret(PathBuf),
    #[error("no secret file configured")]
    NoSecret,
}

/// FUSE tuning for task sandboxes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuseConfig {
    pub attr_ttl_secs: u64,
    pub branch_cache_ttl_secs: u64,
    pub max_background: u16,
    /// Set to false to build sandboxes without mounting them.
    pub mount: bool,
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            attr_ttl_secs: 30,
            branch_cache_ttl_secs: 30,
            max_background: 4,
            mount: true,
        }
    }
}

/// Worker settings, usually read from `worker.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Content-addressed cache shared by all mirrors.
    pub cache_dir: PathBuf,
    /// Parent directory of sandbox temp areas.
    pub tmp_dir: PathBuf,
    pub max_jobs: usize,
    pub secret_file: Option<PathBuf>,
    pub port: u16,
    /// Account whose ids tasks see on daemon-owned `/proc` entries.
    pub nobody_user: Option<String>,
    /// Explicit ids, taking precedence over `nobody_user`.
    pub nobody_uid: Option<u32>,
    pub nobody_gid: Option<u32>,
    /// How long to wait for the master's RPC connection.
    pub connect_timeout_secs: u64,
    pub fuse: FuseConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let cache_root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("termite");
        Self {
            cache_dir: cache_root.join("content"),
            tmp_dir: std::env::temp_dir(),
            max_jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            secret_file: None,
            port: DEFAULT_PORT,
            nobody_user: Some("nobody".to_string()),
            nobody_uid: None,
            nobody_gid: None,
            connect_timeout_secs: 60,
            fuse: FuseConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// The shared secret, with trailing whitespace removed.
    pub fn read_secret(&self) -> Result<Vec<u8>, ConfigError> {
        let path = self.secret_file.as_ref().ok_or(ConfigError::NoSecret)?;
        let mut secret = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        while secret.last().is_some_and(|b| b.is_ascii_whitespace()) {
            secret.pop();
        }
        if secret.is_empty() {
            return Err(ConfigError::EmptySecret(path.clone()));
        }
        Ok(secret)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// uid and gid of the unprivileged task user, if known.
    pub fn nobody(&self) -> Option<(u32, u32)> {
        if let Some(uid) = self.nobody_uid {
            return Some((uid, self.nobody_gid.unwrap_or(uid)));
        }
        let name = self.nobody_user.as_deref()?;
        let ids = lookup_user(name);
        if ids.is_none() {
            tracing::warn!(user = name, "unknown nobody user, /proc owners left as is");
        }
        ids
    }

    pub fn sandbox_options(&self, writable_root: &str) -> SandboxOptions {
        let mut options = SandboxOptions::new(&self.tmp_dir, writable_root);
        options.nobody = self.nobody();
        options.attr_ttl = Duration::from_secs(self.fuse.attr_ttl_secs);
        options.branch_cache_ttl = Duration::from_secs(self.fuse.branch_cache_ttl_secs);
        options.max_background = self.fuse.max_background;
        options.mount = self.fuse.mount;
        options
    }
}

fn lookup_user(name: &str) -> Option<(u32, u32)> {
    let name = CString::new(name).ok()?;
    // SAFETY: `name` is NUL-terminated; the returned record is copied out
    // before any other passwd call can reuse it.
    unsafe {
        let pw = libc::getpwnam(name.as_ptr());
        if pw.is_null() {
            None
        } else {
            Some(((*pw).pw_uid, (*pw).pw_gid))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = WorkerConfig::from_toml_str("").unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.fuse.max_background, 4);
        assert!(config.fuse.mount);
        assert!(config.max_jobs >= 1);
    }

    #[test]
    fn test_partial_override() {
        let config = WorkerConfig::from_toml_str(
            r#"
            max_jobs = 3
            tmp_dir = "/var/tmp/termite"
            nobody_uid = 65534

            [fuse]
            mount = false
            attr_ttl_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.max_jobs, 3);
        assert_eq!(config.tmp_dir, PathBuf::from("/var/tmp/termite"));
        assert_eq!(config.nobody(), Some((65534, 65534)));
        assert_eq!(config.fuse.branch_cache_ttl_secs, 30);

        let options = config.sandbox_options("src");
        assert!(!options.mount);
        assert_eq!(options.attr_ttl, Duration::from_secs(5));
        assert_eq!(options.writable_root, "src");
        assert_eq!(options.tmp_dir, PathBuf::from("/var/tmp/termite"));
    }

    #[test]
    fn test_rejects_bad_types() {
        let err = WorkerConfig::from_toml_str("max_jobs = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_read_secret() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("secret");
        fs::write(&path, "s3cret\n").unwrap();

        let config = WorkerConfig {
            secret_file: Some(path.clone()),
            ..WorkerConfig::default()
        };
        assert_eq!(config.read_secret().unwrap(), b"s3cret");

        fs::write(&path, "\n").unwrap();
        assert!(matches!(
            config.read_secret(),
            Err(ConfigError::EmptySecret(_))
        ));
        assert!(matches!(
            WorkerConfig::default().read_secret(),
            Err(ConfigError::NoSecret)
        ));
    }
}
