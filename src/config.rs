use crate::constants::{APP_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_SETTING_VALUE, EXTRUDER_SECTION};
use crate::settings::SettingKey;
use crate::utils::write_atomically;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml::{Table, Value};

/// How the store reacts to missing or unparsable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationPolicy {
    /// Missing data is replaced by defaults; nothing ever fails.
    Lenient,
    /// Missing file, section or required key fails at open; bad values fail at `get`.
    #[default]
    Strict,
}

/// Where the configuration file lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLocation {
    BesideExecutable,
    UserConfigDir,
    Explicit(PathBuf),
}

impl ConfigLocation {
    pub fn resolve(&self) -> PathBuf {
        match self {
            ConfigLocation::BesideExecutable => {
                let mut path = std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().map(Path::to_path_buf))
                    .unwrap_or_else(|| PathBuf::from("."));
                path.push(CONFIG_FILE_NAME);
                path
            }
            ConfigLocation::UserConfigDir => {
                let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
                path.push(APP_DIR_NAME);
                path.push(CONFIG_FILE_NAME);
                path
            }
            ConfigLocation::Explicit(path) => path.clone(),
        }
    }
}

/// Errors raised while opening a store under the strict policy.
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },
    #[error("Section [{section}] is missing from the configuration")]
    MissingSection { section: String },
    #[error("Key '{key}' is missing from section [{section}]")]
    MissingKey { section: String, key: String },
    #[error("Failed to read configuration {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed configuration {}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },
}

/// A stored value that cannot be used as an integer setting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigValueError {
    #[error("Setting '{key}' is missing")]
    Missing { key: String },
    #[error("Setting '{key}' is not an integer: {found}")]
    NotInteger { key: String, found: String },
}

impl ConfigValueError {
    pub fn key(&self) -> &str {
        match self {
            ConfigValueError::Missing { key } | ConfigValueError::NotInteger { key, .. } => key,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigWriteError {
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Failed to write configuration {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The file exists but could not be read, so rewriting it would lose its contents.
    #[error("Refusing to overwrite unreadable configuration {}", path.display())]
    Unreadable { path: PathBuf },
}

/// Persistent integer settings kept in the `[ExtruderSettings]` section of a
/// flat key/value file.
///
/// Every `set` rewrites the whole file. Keys are matched ignoring ASCII case.
/// Sections and keys this store does not know about are carried through
/// rewrites untouched.
///
/// The file is read as TOML. Text that is not valid TOML but is plain INI
/// (`SpeedPercentage = fast`) is read line by line instead, keeping each bad
/// value as a raw string so only that key fails.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    policy: ValidationPolicy,
    document: Table,
    /// False when a lenient open could not read an existing file.
    writable: bool,
}

impl ConfigStore {
    /// Opens the store at `path`, checking `required` keys under the strict policy.
    pub fn open<K: AsRef<str>>(
        path: impl Into<PathBuf>,
        required: &[K],
        policy: ValidationPolicy,
    ) -> Result<Self, ConfigLoadError> {
        let path = path.into();
        let (document, writable) = match policy {
            ValidationPolicy::Strict => {
                let document = Self::read_document(&path)?;
                Self::check_required(&document, required)?;
                (document, true)
            }
            ValidationPolicy::Lenient => match Self::read_document(&path) {
                Ok(document) => (document, true),
                Err(ConfigLoadError::FileNotFound { .. }) => {
                    tracing::debug!("No configuration at {}, using defaults", path.display());
                    (Table::new(), true)
                }
                Err(e) => {
                    tracing::warn!("Ignoring unusable configuration, changes will not be saved: {}", e);
                    (Table::new(), false)
                }
            },
        };

        tracing::info!(
            "Opened configuration {} ({:?} policy)",
            path.display(),
            policy
        );
        Ok(Self {
            path,
            policy,
            document,
            writable,
        })
    }

    fn read_document(path: &Path) -> Result<Table, ConfigLoadError> {
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ConfigLoadError::FileNotFound {
                path: path.to_path_buf(),
            },
            _ => ConfigLoadError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        match toml::from_str::<Table>(&content) {
            Ok(document) => Ok(document),
            Err(toml_error) => {
                tracing::debug!(
                    "{} is not TOML ({}), reading it as INI",
                    path.display(),
                    toml_error.message()
                );
                parse_ini(&content).map_err(|message| ConfigLoadError::Malformed {
                    path: path.to_path_buf(),
                    message,
                })
            }
        }
    }

    fn check_required<K: AsRef<str>>(
        document: &Table,
        required: &[K],
    ) -> Result<(), ConfigLoadError> {
        let section = document
            .get(EXTRUDER_SECTION)
            .and_then(Value::as_table)
            .ok_or_else(|| ConfigLoadError::MissingSection {
                section: EXTRUDER_SECTION.to_string(),
            })?;
        for key in required {
            if lookup(section, key.as_ref()).is_none() {
                return Err(ConfigLoadError::MissingKey {
                    section: EXTRUDER_SECTION.to_string(),
                    key: key.as_ref().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> ValidationPolicy {
        self.policy
    }

    /// Whether `key` currently has any stored value, parsable or not.
    pub fn contains(&self, key: impl AsRef<str>) -> bool {
        self.section()
            .and_then(|s| lookup(s, key.as_ref()))
            .is_some()
    }

    /// Reads `key` as an integer.
    ///
    /// Under the lenient policy a missing or unparsable value yields
    /// [`DEFAULT_SETTING_VALUE`] and this never fails.
    pub fn get(&self, key: impl AsRef<str>) -> Result<i64, ConfigValueError> {
        let key = key.as_ref();
        match (self.read_value(key), self.policy) {
            (Ok(value), _) => Ok(value),
            (Err(e), ValidationPolicy::Lenient) => {
                tracing::debug!("{}; falling back to {}", e, DEFAULT_SETTING_VALUE);
                Ok(DEFAULT_SETTING_VALUE)
            }
            (Err(e), ValidationPolicy::Strict) => Err(e),
        }
    }

    fn read_value(&self, key: &str) -> Result<i64, ConfigValueError> {
        let value = self
            .section()
            .and_then(|s| lookup(s, key))
            .ok_or_else(|| ConfigValueError::Missing {
                key: key.to_string(),
            })?;
        let not_integer = || ConfigValueError::NotInteger {
            key: key.to_string(),
            found: value.to_string(),
        };
        match value {
            Value::Integer(i) => Ok(*i),
            Value::String(s) => s.trim().parse::<i64>().map_err(|_| not_integer()),
            _ => Err(not_integer()),
        }
    }

    /// Stores `value` under `key` and rewrites the backing file.
    pub fn set(&mut self, key: impl AsRef<str>, value: i64) -> Result<(), ConfigWriteError> {
        let key = key.as_ref();
        if !self.writable {
            return Err(ConfigWriteError::Unreadable {
                path: self.path.clone(),
            });
        }
        let previous = self.document.get(EXTRUDER_SECTION).cloned();
        let mut section = match self.document.remove(EXTRUDER_SECTION) {
            Some(Value::Table(table)) => table,
            Some(other) => {
                tracing::warn!("Replacing non-table [{}] entry: {}", EXTRUDER_SECTION, other);
                Table::new()
            }
            None => Table::new(),
        };
        let variants: Vec<String> = section
            .keys()
            .filter(|k| k.as_str() != key && k.eq_ignore_ascii_case(key))
            .cloned()
            .collect();
        for variant in variants {
            section.remove(&variant);
        }
        section.insert(key.to_string(), Value::Integer(value));
        self.document
            .insert(EXTRUDER_SECTION.to_string(), Value::Table(section));
        tracing::debug!("Set {} = {}", key, value);
        if let Err(e) = self.flush() {
            // Keep memory in line with what is on disk.
            match previous {
                Some(section) => {
                    self.document.insert(EXTRUDER_SECTION.to_string(), section);
                }
                None => {
                    self.document.remove(EXTRUDER_SECTION);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Rewrites the backing file from the in-memory state.
    pub fn flush(&self) -> Result<(), ConfigWriteError> {
        if !self.writable {
            return Err(ConfigWriteError::Unreadable {
                path: self.path.clone(),
            });
        }
        let content = toml::to_string(&self.document)?;
        write_atomically(&self.path, &content).map_err(|source| ConfigWriteError::Io {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!("Wrote configuration {}", self.path.display());
        Ok(())
    }

    /// Flushes and releases the store. A store that could not read its file
    /// holds nothing worth saving and is released without writing.
    pub fn close(self) -> Result<(), ConfigWriteError> {
        if !self.writable {
            return Ok(());
        }
        self.flush()
    }

    /// Every recognized setting with its resolved value.
    pub fn snapshot(&self) -> Vec<(SettingKey, Result<i64, ConfigValueError>)> {
        SettingKey::ALL
            .into_iter()
            .map(|key| (key, self.get(key)))
            .collect()
    }

    fn section(&self) -> Option<&Table> {
        self.document.get(EXTRUDER_SECTION).and_then(Value::as_table)
    }
}

/// Reads INI text: `[section]` headers, `key = value` or `key: value` lines,
/// `#`/`;` comments. Values that are integers become integers, anything else
/// is kept as a raw string.
fn parse_ini(content: &str) -> Result<Table, String> {
    let mut document = Table::new();
    let mut current: Option<String> = None;

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            if !document.contains_key(&name) {
                document.insert(name.clone(), Value::Table(Table::new()));
            }
            current = Some(name);
            continue;
        }

        let separator = line
            .find(['=', ':'])
            .ok_or_else(|| format!("line {}: expected 'key = value'", index + 1))?;
        let key = line[..separator].trim();
        if key.is_empty() {
            return Err(format!("line {}: empty key", index + 1));
        }
        let section_name = current
            .as_ref()
            .ok_or_else(|| format!("line {}: key '{}' outside any section", index + 1, key))?;
        let raw_value = line[separator + 1..].trim();
        let value = match raw_value.parse::<i64>() {
            Ok(i) => Value::Integer(i),
            Err(_) => Value::String(raw_value.to_string()),
        };
        if let Some(Value::Table(section)) = document.get_mut(section_name) {
            section.insert(key.to_string(), value);
        }
    }
    Ok(document)
}

fn lookup<'a>(section: &'a Table, key: &str) -> Option<&'a Value> {
    section.get(key).or_else(|| {
        section
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}
