//! Secrets referenced by CI jobs.
//!
//! A `CiSecret` never holds the secret value; it is a pointer into the
//! remote secret service plus a materialization target. Values are fetched
//! through the [`SecretStore`] port only when materialized.

use crate::error::{Error, Result};
use crate::ports::SecretStore;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A secret used by CI jobs, tagged by how it is materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CiSecret {
    /// Exposed to the job as an environment variable.
    Env(EnvSecret),
    /// Written to a file before the job runs.
    File(FileSecret),
    /// Installed as an SSH identity.
    Key(KeySecret),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EnvSecret {
    /// Namespace of the secret in the remote secret service.
    pub secret: String,
    /// Sub-key holding the value, when the secret is an object.
    #[serde(default)]
    pub key: Option<String>,
    /// Name of the environment variable (eg. `TOKEN`).
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FileSecret {
    pub secret: String,
    #[serde(default)]
    pub key: Option<String>,
    /// Path the secret is written to.
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct KeySecret {
    pub secret: String,
    #[serde(default)]
    pub key: Option<String>,
    /// Host alias to configure for using this key.
    #[serde(default)]
    pub hostname: Option<String>,
}

impl CiSecret {
    /// Namespace of the secret in the remote secret service.
    pub fn secret(&self) -> &str {
        match self {
            CiSecret::Env(s) => &s.secret,
            CiSecret::File(s) => &s.secret,
            CiSecret::Key(s) => &s.secret,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            CiSecret::Env(s) => s.key.as_deref(),
            CiSecret::File(s) => s.key.as_deref(),
            CiSecret::Key(s) => s.key.as_deref(),
        }
    }

    /// True if `other` materializes to the same target as `self`.
    ///
    /// Only the variant and its target field are compared; two aliases may
    /// point at different remote secrets and still collide.
    pub fn is_alias(&self, other: &CiSecret) -> bool {
        match (self, other) {
            (CiSecret::Env(a), CiSecret::Env(b)) => a.name == b.name,
            (CiSecret::File(a), CiSecret::File(b)) => a.path == b.path,
            (CiSecret::Key(a), CiSecret::Key(b)) => a.hostname == b.hostname,
            _ => false,
        }
    }

    /// Fetch the value of the secret, extracting the sub-key when set.
    pub fn value(&self, store: &dyn SecretStore) -> Result<serde_json::Value> {
        let data = store.get(self.secret())?;
        match self.key() {
            Some(key) => data
                .get(key)
                .cloned()
                .ok_or_else(|| Error::MissingSecretKey {
                    secret: self.secret().to_string(),
                    key: key.to_string(),
                }),
            None => Ok(data),
        }
    }
}

impl FileSecret {
    /// Write the secret to disk.
    ///
    /// Complex values (lists/objects) are JSON serialized.
    pub fn write(&self, store: &dyn SecretStore) -> Result<()> {
        let data = CiSecret::File(self.clone()).value(store)?;
        let text = match data {
            serde_json::Value::String(s) => s,
            other => serde_json::to_string(&other)?,
        };
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

impl KeySecret {
    /// Install the key under `ssh_dir`.
    ///
    /// The key is created as `id_rsa`, unless `hostname` is set, then
    /// `id_rsa.{hostname}` is used and the `hostname` alias to `github.com`
    /// is appended to `config`.
    pub fn write(&self, store: &dyn SecretStore, ssh_dir: &Path) -> Result<()> {
        let dest = match &self.hostname {
            Some(hostname) => {
                let mut cfg = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(ssh_dir.join("config"))?;
                writeln!(cfg, "Host {hostname}")?;
                writeln!(cfg, "HostName github.com")?;
                writeln!(cfg, "IdentityFile ~/.ssh/id_rsa.{hostname}")?;
                ssh_dir.join(format!("id_rsa.{hostname}"))
            }
            None => ssh_dir.join("id_rsa"),
        };
        let data = CiSecret::Key(self.clone()).value(store)?;
        let key = data.as_str().ok_or_else(|| Error::SecretValue {
            secret: self.secret.clone(),
            message: "expected the key to be a string... missing `key`?".to_string(),
        })?;
        std::fs::write(&dest, key)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o400))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct FakeStore(BTreeMap<String, serde_json::Value>);

    impl SecretStore for FakeStore {
        fn get(&self, name: &str) -> Result<serde_json::Value> {
            self.0.get(name).cloned().ok_or_else(|| Error::SecretFetch {
                secret: name.to_string(),
                message: "not found".to_string(),
            })
        }
    }

    #[test]
    fn test_wire_form_round_trip() {
        let secret: CiSecret = serde_json::from_str(
            r#"{"type": "env", "secret": "project/token", "name": "TOKEN"}"#,
        )
        .unwrap();
        assert_eq!(
            secret,
            CiSecret::Env(EnvSecret {
                secret: "project/token".to_string(),
                key: None,
                name: "TOKEN".to_string(),
            })
        );
        let text = serde_json::to_string(&secret).unwrap();
        let back: CiSecret = serde_json::from_str(&text).unwrap();
        assert_eq!(secret, back);
    }

    #[test]
    fn test_alias_ignores_source() {
        let a = CiSecret::Env(EnvSecret {
            secret: "project/a".to_string(),
            key: None,
            name: "TOKEN".to_string(),
        });
        let b = CiSecret::Env(EnvSecret {
            secret: "project/b".to_string(),
            key: Some("value".to_string()),
            name: "TOKEN".to_string(),
        });
        let c = CiSecret::File(FileSecret {
            secret: "project/a".to_string(),
            key: None,
            path: PathBuf::from("/tmp/cfg"),
        });
        assert!(a.is_alias(&b));
        assert!(!a.is_alias(&c));
    }

    #[test]
    fn test_value_key_extraction() {
        let store = FakeStore(BTreeMap::from([(
            "project/deploy".to_string(),
            serde_json::json!({"key": "---PRIVATE---"}),
        )]));
        let secret = CiSecret::Key(KeySecret {
            secret: "project/deploy".to_string(),
            key: Some("key".to_string()),
            hostname: None,
        });
        assert_eq!(
            secret.value(&store).unwrap(),
            serde_json::json!("---PRIVATE---")
        );

        let missing = CiSecret::Key(KeySecret {
            secret: "project/deploy".to_string(),
            key: Some("nope".to_string()),
            hostname: None,
        });
        assert!(matches!(
            missing.value(&store),
            Err(Error::MissingSecretKey { .. })
        ));
    }

    #[test]
    fn test_file_write_serializes_complex_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        let store = FakeStore(BTreeMap::from([(
            "project/cfg".to_string(),
            serde_json::json!({"a": 1}),
        )]));
        let secret = FileSecret {
            secret: "project/cfg".to_string(),
            key: None,
            path: path.clone(),
        };
        secret.write(&store).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn test_key_write_with_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let store = FakeStore(BTreeMap::from([(
            "project/deploy".to_string(),
            serde_json::json!("---PRIVATE---"),
        )]));
        let secret = KeySecret {
            secret: "project/deploy".to_string(),
            key: None,
            hostname: Some("builds".to_string()),
        };
        secret.write(&store, dir.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("id_rsa.builds")).unwrap(),
            "---PRIVATE---"
        );
        let cfg = std::fs::read_to_string(dir.path().join("config")).unwrap();
        assert!(cfg.contains("Host builds"));
        assert!(cfg.contains("IdentityFile ~/.ssh/id_rsa.builds"));
    }
}
