use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "forever-web.json";
pub const KEY_FOREVER: &str = "forever";
pub const KEY_REFRESH: &str = "refresh";
pub const KEY_MANIPULATION: &str = "manipulation";
pub const DEFAULT_REFRESH_MS: u64 = 5000;
pub const DEFAULT_MANIPULATION: bool = true;

/// Registry root layout: `<root>/sock` holds control sockets and
/// `<root>/pids` holds the pid files whose churn drives refreshes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeverPaths {
    root: PathBuf,
}

impl ForeverPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sock_dir(&self) -> PathBuf {
        self.root.join("sock")
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.root.join("pids")
    }

    pub fn watch_dirs(&self) -> [PathBuf; 2] {
        [self.sock_dir(), self.pids_dir()]
    }

    pub fn is_available(&self) -> bool {
        self.watch_dirs().iter().all(|dir| dir.is_dir())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Number(Number),
    Text(String),
}

impl ConfigValue {
    /// Interprets command-line text: numbers and `true`/`false` keep their
    /// type, everything else stays a string.
    pub fn coerce(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "true" => return ConfigValue::Bool(true),
            "false" => return ConfigValue::Bool(false),
            _ => {}
        }
        if let Ok(int) = trimmed.parse::<i64>() {
            return ConfigValue::Number(Number::from(int));
        }
        if let Some(num) = trimmed
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
        {
            return ConfigValue::Number(num);
        }
        ConfigValue::Text(raw.to_string())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(value) => Some(*value),
            ConfigValue::Text(text) => match text.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            ConfigValue::Number(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::Number(num) => num
                .as_u64()
                .or_else(|| num.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64)),
            ConfigValue::Text(text) => text.trim().parse().ok(),
            ConfigValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Text(text) => Some(text),
            _ => None,
        }
    }

    fn into_json(self) -> Value {
        match self {
            ConfigValue::Bool(value) => Value::Bool(value),
            ConfigValue::Number(num) => Value::Number(num),
            ConfigValue::Text(text) => Value::String(text),
        }
    }

    fn from_json(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<u64> for ConfigValue {
    fn from(value: u64) -> Self {
        ConfigValue::Number(Number::from(value))
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(value) => write!(f, "{value}"),
            ConfigValue::Number(num) => write!(f, "{num}"),
            ConfigValue::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config file {} is not valid JSON: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config file {} must hold a JSON object", .path.display())]
    NotAnObject { path: PathBuf },
}

/// Modification time and length of the file a cached map was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn of(meta: &fs::Metadata) -> Self {
        Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        }
    }
}

#[derive(Debug)]
struct CachedMap {
    stamp: FileStamp,
    map: Map<String, Value>,
}

/// Key-value store persisted as a JSON object. Reads are served from the
/// last parse while the file's stamp is unchanged, so edits made by the CLI
/// still reach a running hub. Clones share the cache.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<Mutex<Option<CachedMap>>>,
}

impl ConfigStore {
    pub fn open(root: &Path) -> Self {
        Self::at(root.join(CONFIG_FILE_NAME))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Result<Option<ConfigValue>, ConfigError> {
        let mut map = self.load()?;
        Ok(map.remove(key).and_then(ConfigValue::from_json))
    }

    pub fn set(&self, key: &str, value: impl Into<ConfigValue>) -> Result<(), ConfigError> {
        let mut map = self.load()?;
        map.insert(key.to_string(), value.into().into_json());
        self.save(&map)
    }

    pub fn set_raw(&self, key: &str, raw: &str) -> Result<ConfigValue, ConfigError> {
        let value = ConfigValue::coerce(raw);
        self.set(key, value.clone())?;
        Ok(value)
    }

    /// Removes `key`, then restores its default when it has one.
    pub fn clear(&self, key: &str) -> Result<Option<ConfigValue>, ConfigError> {
        let mut map = self.load()?;
        map.remove(key);
        let restored = default_for(key);
        if let Some(value) = restored.clone() {
            map.insert(key.to_string(), value.into_json());
        }
        self.save(&map)?;
        Ok(restored)
    }

    pub fn list(&self) -> Result<BTreeMap<String, ConfigValue>, ConfigError> {
        Ok(self
            .load()?
            .into_iter()
            .filter_map(|(key, value)| ConfigValue::from_json(value).map(|value| (key, value)))
            .collect())
    }

    /// Fills in the known keys that are missing without touching the rest.
    pub fn seed(&self, root: &Path) -> Result<(), ConfigError> {
        let mut map = self.load()?;
        let mut changed = false;
        let defaults = [
            (KEY_FOREVER, ConfigValue::Text(root.display().to_string())),
            (KEY_REFRESH, ConfigValue::from(DEFAULT_REFRESH_MS)),
            (KEY_MANIPULATION, ConfigValue::Bool(DEFAULT_MANIPULATION)),
        ];
        for (key, value) in defaults {
            if !map.contains_key(key) {
                map.insert(key.to_string(), value.into_json());
                changed = true;
            }
        }
        if changed {
            self.save(&map)?;
        }
        Ok(())
    }

    pub fn forever_root(&self, fallback: &Path) -> PathBuf {
        match self.get(KEY_FOREVER) {
            Ok(Some(ConfigValue::Text(text))) if !text.trim().is_empty() => PathBuf::from(text),
            _ => fallback.to_path_buf(),
        }
    }

    pub fn forever_paths(&self, fallback: &Path) -> ForeverPaths {
        ForeverPaths::new(self.forever_root(fallback))
    }

    pub fn refresh_interval(&self) -> Duration {
        let ms = self
            .get(KEY_REFRESH)
            .ok()
            .flatten()
            .and_then(|value| value.as_u64())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_REFRESH_MS);
        Duration::from_millis(ms)
    }

    pub fn manipulation_enabled(&self) -> bool {
        self.get(KEY_MANIPULATION)
            .ok()
            .flatten()
            .and_then(|value| value.as_bool())
            .unwrap_or(DEFAULT_MANIPULATION)
    }

    fn load(&self) -> Result<Map<String, Value>, ConfigError> {
        let stamp = match fs::metadata(&self.path) {
            Ok(meta) => FileStamp::of(&meta),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.remember(None);
                return Ok(Map::new());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if let Ok(cache) = self.cache.lock() {
            if let Some(cached) = cache.as_ref().filter(|cached| cached.stamp == stamp) {
                return Ok(cached.map.clone());
            }
        }

        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let map = if raw.trim().is_empty() {
            Map::new()
        } else {
            match serde_json::from_str(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(ConfigError::NotAnObject {
                        path: self.path.clone(),
                    })
                }
                Err(source) => {
                    return Err(ConfigError::Parse {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        };
        self.remember(Some(CachedMap {
            stamp,
            map: map.clone(),
        }));
        Ok(map)
    }

    fn remember(&self, cached: Option<CachedMap>) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = cached;
        }
    }

    fn save(&self, map: &Map<String, Value>) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let payload = serde_json::to_string_pretty(map).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload).map_err(io_error)?;
        fs::rename(&tmp_path, &self.path).map_err(io_error)?;
        let cached = fs::metadata(&self.path).ok().map(|meta| CachedMap {
            stamp: FileStamp::of(&meta),
            map: map.clone(),
        });
        self.remember(cached);
        Ok(())
    }
}

fn default_for(key: &str) -> Option<ConfigValue> {
    match key {
        KEY_REFRESH => Some(ConfigValue::from(DEFAULT_REFRESH_MS)),
        KEY_MANIPULATION => Some(ConfigValue::Bool(DEFAULT_MANIPULATION)),
        _ => None,
    }
}
