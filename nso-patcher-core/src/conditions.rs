use std::collections::BTreeMap;

use crate::{PatchError, Result};

/// Decides whether an `onlyif` condition attached to a flag group or diff
/// file holds for the current world.
pub trait ConditionEvaluator {
    fn evaluate_onlyif(&self, condition: &str) -> Result<bool>;
}

/// Evaluates conditions against the world's setting values.
///
/// Accepted forms are `name`, `name == value`, `name != value` and any of
/// those prefixed with `not `. A bare name is true unless its value is one
/// of `off`, `false`, `no`, `0` or empty.
pub struct SettingConditions<'a> {
    settings: &'a BTreeMap<String, String>,
}

impl<'a> SettingConditions<'a> {
    pub fn new(settings: &'a BTreeMap<String, String>) -> Self {
        Self { settings }
    }

    fn lookup(&self, name: &str, condition: &str) -> Result<&'a str> {
        self.settings
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| PatchError::Condition {
                condition: condition.to_string(),
                detail: format!("unknown setting '{name}'"),
            })
    }
}

impl ConditionEvaluator for SettingConditions<'_> {
    fn evaluate_onlyif(&self, condition: &str) -> Result<bool> {
        let trimmed = condition.trim();

        if let Some(rest) = trimmed.strip_prefix("not ") {
            return Ok(!self.evaluate_onlyif(rest)?);
        }

        if let Some((name, value)) = trimmed.split_once("!=") {
            return Ok(self.lookup(name.trim(), condition)? != value.trim());
        }

        if let Some((name, value)) = trimmed.split_once("==") {
            return Ok(self.lookup(name.trim(), condition)? == value.trim());
        }

        let value = self.lookup(trimmed, condition)?;
        Ok(!matches!(
            value.to_ascii_lowercase().as_str(),
            "off" | "false" | "no" | "0" | ""
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BTreeMap<String, String> {
        let mut s = BTreeMap::new();
        s.insert("tunic_swap".to_string(), "off".to_string());
        s.insert("open_thunderhead".to_string(), "on".to_string());
        s.insert("starting_sword".to_string(), "goddess_sword".to_string());
        s
    }

    #[test]
    fn bare_names_use_truthiness() {
        let s = settings();
        let c = SettingConditions::new(&s);
        assert!(c.evaluate_onlyif("open_thunderhead").unwrap());
        assert!(!c.evaluate_onlyif("tunic_swap").unwrap());
        assert!(c.evaluate_onlyif("not tunic_swap").unwrap());
    }

    #[test]
    fn comparisons() {
        let s = settings();
        let c = SettingConditions::new(&s);
        assert!(c.evaluate_onlyif("starting_sword == goddess_sword").unwrap());
        assert!(!c.evaluate_onlyif("starting_sword != goddess_sword").unwrap());
        assert!(!c.evaluate_onlyif("tunic_swap != off").unwrap());
    }

    #[test]
    fn unknown_setting_is_an_error() {
        let s = settings();
        let c = SettingConditions::new(&s);
        let err = c.evaluate_onlyif("random_bottles == on").unwrap_err();
        assert!(matches!(err, PatchError::Condition { .. }));
    }
}
