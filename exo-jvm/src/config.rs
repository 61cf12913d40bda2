//! Assembles a validated [`VmConfig`] from system properties and an optional
//! TOML file, per `SPEC_FULL.md` §10.3. System properties always win over the
//! file, so a launcher can override a shared config for one run.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{VmError, VmResult};
use crate::properties::{self, HEAP_GRANULARITY, HEAP_SIZE, JAVA_STACK_SIZE, LOADER_SIZE,
    STACK_DEFAULT, STACK_MAXIMUM, STACK_MINIMUM};

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub boot_class_path: Vec<String>,
    pub stack_minimum: u64,
    pub stack_maximum: u64,
    pub stack_default: u64,
    pub java_stack_size: u64,
    pub heap_size: u64,
    pub heap_granularity: u64,
    pub loader_size: u64,
    pub verbose_tags: Vec<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            boot_class_path: Vec::new(),
            stack_minimum: properties::MINIMUM_STACK_BYTES,
            stack_maximum: 8 * 1024 * 1024,
            stack_default: 512 * 1024,
            java_stack_size: 256 * 1024,
            heap_size: 64 * 1024 * 1024,
            heap_granularity: 16,
            loader_size: 4 * 1024 * 1024,
            verbose_tags: Vec::new(),
        }
    }
}

impl VmConfig {
    /// Builds a config from a flat property map (as a launcher would collect
    /// from `-D` flags) optionally layered over a TOML file read first.
    pub fn from_properties(
        toml_path: Option<&Path>,
        properties: &BTreeMap<String, String>,
    ) -> VmResult<Self> {
        let mut cfg = match toml_path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };

        for (key, value) in properties {
            cfg.apply_property(key, value)?;
        }
        cfg.validate()
    }

    fn from_toml_file(path: &Path) -> VmResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| VmError::Internal(format!("reading config file {path:?}: {e}")))?;
        let table: toml::Value = toml::from_str(&text)
            .map_err(|e| VmError::Internal(format!("parsing config file {path:?}: {e}")))?;

        let mut cfg = Self::default();
        if let Some(table) = table.as_table() {
            for (key, value) in table {
                let value = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                cfg.apply_property(key, &value)?;
            }
        }
        Ok(cfg)
    }

    fn apply_property(&mut self, key: &str, value: &str) -> VmResult<()> {
        match key {
            properties::BOOT_CLASS_PATH => {
                self.boot_class_path = value.split(':').map(str::to_owned).collect();
            }
            properties::BOOT_CLASS_PATH_PREPEND => {
                let mut prepend: Vec<String> = value.split(':').map(str::to_owned).collect();
                prepend.extend(self.boot_class_path.drain(..));
                self.boot_class_path = prepend;
            }
            properties::BOOT_CLASS_PATH_APPEND => {
                self.boot_class_path
                    .extend(value.split(':').map(str::to_owned));
            }
            STACK_MINIMUM => self.stack_minimum = properties::parse_size(value)?,
            STACK_MAXIMUM => self.stack_maximum = properties::parse_size(value)?,
            STACK_DEFAULT => self.stack_default = properties::parse_size(value)?,
            JAVA_STACK_SIZE => self.java_stack_size = properties::parse_size(value)?,
            HEAP_SIZE => self.heap_size = properties::parse_size(value)?,
            HEAP_GRANULARITY => self.heap_granularity = properties::parse_size(value)?,
            LOADER_SIZE => self.loader_size = properties::parse_size(value)?,
            _ => {
                if let Some(tag) = properties::verbose_tag(key) {
                    self.verbose_tags.push(tag.to_owned());
                }
                // unrecognized properties are ignored, matching a launcher
                // forwarding arbitrary -D flags to other subsystems.
            }
        }
        Ok(())
    }

    fn validate(self) -> VmResult<Self> {
        properties::validate_stack_size(self.stack_minimum)?;
        properties::validate_stack_size(self.stack_maximum)?;
        properties::validate_stack_size(self.stack_default)?;
        if self.stack_minimum > self.stack_maximum {
            return Err(VmError::Internal(
                "jc.stack.minimum exceeds jc.stack.maximum".into(),
            ));
        }
        if self.heap_size == 0 {
            return Err(VmError::Internal("jc.heap.size must be nonzero".into()));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(VmConfig::default().validate().is_ok());
    }

    #[test]
    fn properties_override_defaults() {
        let mut props = BTreeMap::new();
        props.insert(HEAP_SIZE.to_string(), "128M".to_string());
        props.insert(
            properties::BOOT_CLASS_PATH.to_string(),
            "/boot/a:/boot/b".to_string(),
        );
        let cfg = VmConfig::from_properties(None, &props).unwrap();
        assert_eq!(cfg.heap_size, 128 * 1024 * 1024);
        assert_eq!(cfg.boot_class_path, vec!["/boot/a", "/boot/b"]);
    }

    #[test]
    fn rejects_inverted_stack_bounds() {
        let mut props = BTreeMap::new();
        props.insert(STACK_MINIMUM.to_string(), "8M".to_string());
        props.insert(STACK_MAXIMUM.to_string(), "1M".to_string());
        assert!(VmConfig::from_properties(None, &props).is_err());
    }

    #[test]
    fn verbose_tags_collected() {
        let mut props = BTreeMap::new();
        props.insert("jc.verbose.gc".to_string(), "true".to_string());
        props.insert("jc.verbose.loader".to_string(), "true".to_string());
        let cfg = VmConfig::from_properties(None, &props).unwrap();
        assert_eq!(cfg.verbose_tags.len(), 2);
    }
}
