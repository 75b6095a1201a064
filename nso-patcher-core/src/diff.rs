use serde::{Deserialize, Serialize};
use serde_yaml_ng::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::conditions::ConditionEvaluator;
use crate::{PatchError, Result};

pub const DIFF_FILE_SUFFIX: &str = "-diff.yaml";

/// Bytes to write at an absolute virtual address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Diff {
    pub address: u64,
    pub bytes: Vec<u8>,
}

/// The diffs from one `*-diff.yaml` file, in file order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiffFile {
    pub name: String,
    pub diffs: Vec<Diff>,
}

impl DiffFile {
    pub fn new(name: impl Into<String>, diffs: Vec<Diff>) -> Self {
        Self {
            name: name.into(),
            diffs,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let src = fs::read_to_string(path).map_err(|source| PatchError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::from_yaml_str(name, &src)
    }

    pub fn from_yaml_str(name: impl Into<String>, src: &str) -> Result<Self> {
        let name = name.into();
        let value: Value = serde_yaml_ng::from_str(src)?;
        let mapping = match value {
            Value::Null => Mapping::new(),
            Value::Mapping(m) => m,
            _ => {
                return Err(PatchError::DiffFormat {
                    file: name,
                    detail: "top level is not a mapping".to_string(),
                })
            }
        };

        let mut diffs = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let address = parse_address(&key).ok_or_else(|| PatchError::DiffFormat {
                file: name.clone(),
                detail: format!("key {:?} is not an address", key),
            })?;
            let bytes = parse_bytes(&value).ok_or_else(|| PatchError::DiffFormat {
                file: name.clone(),
                detail: format!("payload at {:#X} is not a list of bytes", address),
            })?;
            diffs.push(Diff { address, bytes });
        }

        Ok(Self { name, diffs })
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        let mut mapping = Mapping::new();
        for diff in &self.diffs {
            let bytes = diff
                .bytes
                .iter()
                .map(|&b| Value::Number(u64::from(b).into()))
                .collect();
            mapping.insert(Value::Number(diff.address.into()), Value::Sequence(bytes));
        }
        Ok(serde_yaml_ng::to_string(&mapping)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_yaml_string()?)?;
        Ok(())
    }
}

fn parse_address(key: &Value) -> Option<u64> {
    match key {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).ok()
            } else {
                s.parse().ok()
            }
        }
        _ => None,
    }
}

fn parse_bytes(value: &Value) -> Option<Vec<u8>> {
    value
        .as_sequence()?
        .iter()
        .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect()
}

/// Diff files directly inside `dir`, sorted by file name so that load order
/// is stable across platforms. A missing directory yields no files.
pub fn find_diff_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| PatchError::Config(format!("failed to list {}: {e}", dir.display())))?;
        if entry.file_type().is_file()
            && entry.file_name().to_string_lossy().ends_with(DIFF_FILE_SUFFIX)
        {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

/// Diff files whose name contains `pattern` are applied only while
/// `only_if` holds.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiffSkipRule {
    pub pattern: String,
    pub only_if: String,
}

impl DiffSkipRule {
    pub fn new(pattern: impl Into<String>, only_if: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            only_if: only_if.into(),
        }
    }
}

pub fn default_skip_rules() -> Vec<DiffSkipRule> {
    vec![DiffSkipRule::new("tunic-swap", "tunic_swap != off")]
}

pub fn should_skip_diff(
    rules: &[DiffSkipRule],
    conditions: &dyn ConditionEvaluator,
    file_name: &str,
) -> Result<bool> {
    for rule in rules {
        if file_name.contains(&rule.pattern) && !conditions.evaluate_onlyif(&rule.only_if)? {
            return Ok(true);
        }
    }
    Ok(false)
}
