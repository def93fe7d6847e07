//! Durable JSON-backed runtime settings with hot reload.
//!
//! Two files back the mutable state: the common file (admin identity,
//! approved senders, per-service instructions) shared by every service, and
//! the timed-messages file (admin setup code, scheduling group). Reads
//! compare the file mtime and reload when it changed; writes go through a
//! process-local mutex and a temp-file-and-rename. A file that fails to
//! parse yields the defaults and a logged warning, never an error to the
//! caller.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use serde_json::{Map, Value};
use tracing::warn;

use crate::{auth::six_digit_code, normalize::normalize_sender_id, Result};

struct Snapshot {
    data: Map<String, Value>,
    mtime: Option<SystemTime>,
}

struct JsonFileStore {
    path: PathBuf,
    label: &'static str,
    defaults: fn() -> Map<String, Value>,
    state: Mutex<Snapshot>,
}

impl JsonFileStore {
    fn new(path: PathBuf, label: &'static str, defaults: fn() -> Map<String, Value>) -> Self {
        let data = Self::load_from_disk(&path, label, defaults);
        let mtime = Self::mtime(&path);
        Self {
            path,
            label,
            defaults,
            state: Mutex::new(Snapshot { data, mtime }),
        }
    }

    fn mtime(path: &Path) -> Option<SystemTime> {
        fs::metadata(path).and_then(|md| md.modified()).ok()
    }

    fn load_from_disk(
        path: &Path,
        label: &'static str,
        defaults: fn() -> Map<String, Value>,
    ) -> Map<String, Value> {
        if !path.exists() {
            return defaults();
        }
        let parsed = fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok())
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            });
        match parsed {
            Some(map) => map,
            None => {
                warn!("[{label}] failed to parse {}, using defaults", path.display());
                defaults()
            }
        }
    }

    /// Current contents, reloaded from disk when the file changed.
    fn read(&self) -> Map<String, Value> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = Self::mtime(&self.path);
        if current.is_some() && current != state.mtime {
            state.data = Self::load_from_disk(&self.path, self.label, self.defaults);
            state.mtime = current;
        }
        state.data.clone()
    }

    fn get_str(&self, key: &str) -> String {
        self.read()
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// Read-modify-write with temp-file-and-rename semantics.
    fn mutate(&self, apply: impl FnOnce(&mut Map<String, Value>)) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut data = Self::load_from_disk(&self.path, self.label, self.defaults);
        apply(&mut data);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&Value::Object(data.clone()))?)?;
        fs::rename(&tmp, &self.path)?;

        state.data = data;
        state.mtime = Self::mtime(&self.path);
        Ok(())
    }
}

fn common_defaults() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("admin_sender_id".to_string(), Value::String(String::new()));
    map.insert("approved_numbers".to_string(), Value::Array(Vec::new()));
    map.insert("instructions".to_string(), Value::Object(Map::new()));
    map
}

fn timed_defaults() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("group_id".to_string(), Value::String(String::new()));
    map.insert("admin_setup_code".to_string(), Value::String(String::new()));
    map
}

/// Settings shared by every service: admin identity, approved senders and
/// the per-service instruction blurbs.
pub struct CommonRuntimeConfig {
    file: JsonFileStore,
}

impl CommonRuntimeConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFileStore::new(path.into(), "common_config", common_defaults),
        }
    }

    pub fn admin_sender_id(&self) -> String {
        self.file.get_str("admin_sender_id")
    }

    /// Also marks the admin as approved so they never need `!auth`.
    pub fn set_admin_sender_id(&self, sender_id: &str) -> Result<()> {
        let normalized = normalize_sender_id(sender_id);
        self.file.mutate(|data| {
            data.insert(
                "admin_sender_id".to_string(),
                Value::String(sender_id.to_string()),
            );
            push_approved(data, &normalized);
        })
    }

    /// Normalized approved numbers, always including the admin's.
    pub fn approved_numbers(&self) -> Vec<String> {
        let data = self.file.read();
        let mut numbers: Vec<String> = data
            .get("approved_numbers")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(normalize_sender_id)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let admin = data
            .get("admin_sender_id")
            .and_then(Value::as_str)
            .map(normalize_sender_id)
            .unwrap_or_default();
        if !admin.is_empty() && !numbers.contains(&admin) {
            numbers.push(admin);
        }
        numbers
    }

    pub fn add_approved_number(&self, number: &str) -> Result<()> {
        let normalized = normalize_sender_id(number);
        self.file.mutate(|data| push_approved(data, &normalized))
    }

    pub fn is_sender_approved(&self, sender_id: &str) -> bool {
        let normalized = normalize_sender_id(sender_id);
        !normalized.is_empty() && self.approved_numbers().contains(&normalized)
    }

    pub fn instructions(&self) -> BTreeMap<String, String> {
        self.file
            .read()
            .get("instructions")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_instruction(&self, service: &str, text: &str) -> Result<()> {
        self.file.mutate(|data| {
            let entry = data
                .entry("instructions")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(obj) = entry {
                obj.insert(service.to_string(), Value::String(text.to_string()));
            }
        })
    }
}

fn push_approved(data: &mut Map<String, Value>, normalized: &str) {
    if normalized.is_empty() {
        return;
    }
    let entry = data
        .entry("approved_numbers")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(items) = entry {
        if !items.iter().any(|v| v.as_str() == Some(normalized)) {
            items.push(Value::String(normalized.to_string()));
        }
    }
}

/// Timed-messages settings: the one-shot admin setup code and, in
/// non-assistant mode, the group permitted to issue commands.
pub struct TimedRuntimeConfig {
    file: JsonFileStore,
    common: Arc<CommonRuntimeConfig>,
}

impl TimedRuntimeConfig {
    pub fn new(path: impl Into<PathBuf>, common: Arc<CommonRuntimeConfig>) -> Self {
        Self {
            file: JsonFileStore::new(path.into(), "timed_messages_config", timed_defaults),
            common,
        }
    }

    pub fn admin_sender_id(&self) -> String {
        self.common.admin_sender_id()
    }

    /// Setting the admin consumes the setup code.
    pub fn set_admin_sender_id(&self, sender_id: &str) -> Result<()> {
        self.common.set_admin_sender_id(sender_id)?;
        self.file.mutate(|data| {
            data.insert(
                "admin_setup_code".to_string(),
                Value::String(String::new()),
            );
        })
    }

    /// Current setup code; generated and persisted on first use.
    pub fn admin_setup_code(&self) -> Result<String> {
        let code = self.file.get_str("admin_setup_code");
        if !code.is_empty() {
            return Ok(code);
        }
        let code = six_digit_code();
        let persisted = code.clone();
        self.file.mutate(move |data| {
            data.insert("admin_setup_code".to_string(), Value::String(persisted));
        })?;
        Ok(code)
    }

    pub fn approved_numbers(&self) -> Vec<String> {
        self.common.approved_numbers()
    }

    pub fn add_approved_number(&self, number: &str) -> Result<()> {
        self.common.add_approved_number(number)
    }

    pub fn is_sender_approved(&self, sender_id: &str) -> bool {
        self.common.is_sender_approved(sender_id)
    }

    pub fn instructions(&self) -> BTreeMap<String, String> {
        self.common.instructions()
    }

    pub fn set_instruction(&self, service: &str, text: &str) -> Result<()> {
        self.common.set_instruction(service, text)
    }

    pub fn scheduling_group(&self) -> String {
        self.file.get_str("group_id")
    }

    pub fn set_scheduling_group(&self, group_id: &str) -> Result<()> {
        self.file.mutate(|data| {
            data.insert("group_id".to_string(), Value::String(group_id.to_string()));
        })
    }

    pub fn clear_scheduling_group(&self) -> Result<()> {
        self.file.mutate(|data| {
            data.insert("group_id".to_string(), Value::String(String::new()));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tmp_dir() -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = PathBuf::from(format!(
            "/tmp/wtm-runtime-config-{}-{n}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn pair(dir: &Path) -> (Arc<CommonRuntimeConfig>, TimedRuntimeConfig) {
        let common = Arc::new(CommonRuntimeConfig::new(dir.join("common.json")));
        let timed = TimedRuntimeConfig::new(dir.join("timed.json"), common.clone());
        (common, timed)
    }

    #[test]
    fn defaults_when_files_missing() {
        let dir = tmp_dir();
        let (common, timed) = pair(&dir);
        assert_eq!(common.admin_sender_id(), "");
        assert!(common.approved_numbers().is_empty());
        assert!(common.instructions().is_empty());
        assert_eq!(timed.scheduling_group(), "");
    }

    #[test]
    fn setting_admin_approves_and_clears_setup_code() {
        let dir = tmp_dir();
        let (common, timed) = pair(&dir);

        let code = timed.admin_setup_code().unwrap();
        assert_eq!(code.len(), 6);
        // Stable until consumed.
        assert_eq!(timed.admin_setup_code().unwrap(), code);

        timed
            .set_admin_sender_id("15559990000@s.whatsapp.net")
            .unwrap();
        assert_eq!(timed.admin_sender_id(), "15559990000@s.whatsapp.net");
        assert!(common.is_sender_approved("15559990000"));
        assert_eq!(timed.file.get_str("admin_setup_code"), "");

        // Next read generates a fresh code.
        let next = timed.admin_setup_code().unwrap();
        assert_eq!(next.len(), 6);
    }

    #[test]
    fn approved_numbers_normalize_and_include_admin() {
        let dir = tmp_dir();
        let (common, _) = pair(&dir);

        common.set_admin_sender_id("+1 555 999 0000").unwrap();
        common.add_approved_number("15551234567@s.whatsapp.net").unwrap();
        common.add_approved_number("15551234567").unwrap(); // dedupe

        let numbers = common.approved_numbers();
        assert_eq!(numbers.len(), 2);
        assert!(numbers.contains(&"15551234567".to_string()));
        assert!(numbers.contains(&"15559990000".to_string()));
        assert!(common.is_sender_approved("1-555-123-4567"));
        assert!(!common.is_sender_approved("15550000000"));
    }

    #[test]
    fn reloads_when_file_changes_on_disk() {
        let dir = tmp_dir();
        let (common, _) = pair(&dir);
        assert_eq!(common.admin_sender_id(), "");

        // Another process rewrites the file.
        fs::write(
            dir.join("common.json"),
            r#"{"admin_sender_id": "15551112222", "approved_numbers": []}"#,
        )
        .unwrap();
        assert_eq!(common.admin_sender_id(), "15551112222");
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tmp_dir();
        fs::write(dir.join("common.json"), "{not json").unwrap();
        let common = CommonRuntimeConfig::new(dir.join("common.json"));
        assert_eq!(common.admin_sender_id(), "");
        assert!(common.approved_numbers().is_empty());
    }

    #[test]
    fn instructions_round_trip() {
        let dir = tmp_dir();
        let (common, timed) = pair(&dir);
        timed
            .set_instruction("timed_messages", "Timed Messages: use *add*")
            .unwrap();
        let instructions = common.instructions();
        assert_eq!(
            instructions.get("timed_messages").map(String::as_str),
            Some("Timed Messages: use *add*")
        );
    }

    #[test]
    fn scheduling_group_set_and_clear() {
        let dir = tmp_dir();
        let (_, timed) = pair(&dir);
        timed.set_scheduling_group("group-1").unwrap();
        assert_eq!(timed.scheduling_group(), "group-1");
        timed.clear_scheduling_group().unwrap();
        assert_eq!(timed.scheduling_group(), "");
    }
}
