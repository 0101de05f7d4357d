use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::{pipeline::Command, types::Label};

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ActionBinding {
    pub label: Label,
    pub action: Command,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub num_classes: usize,
    pub top_k: usize,
    pub tick_interval_ms: u64,
    pub dispatch_threshold: f32,
    pub min_pose_confidence: f32,
    pub min_part_confidence: f32,
    pub thumbnail_side: u32,
    pub camera_index: u32,
    pub start_detecting: bool,
    pub classifier_path: Option<PathBuf>,
    pub save_path: PathBuf,
    pub actions: Vec<ActionBinding>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            num_classes: 7,
            top_k: 10,
            tick_interval_ms: 500,
            dispatch_threshold: 0.6,
            min_pose_confidence: 0.1,
            min_part_confidence: 0.5,
            thumbnail_side: 32,
            camera_index: 0,
            start_detecting: true,
            classifier_path: None,
            save_path: PathBuf::from("classifiermodel.json"),
            actions: vec![
                ActionBinding {
                    label: 1,
                    action: Command::Scroll { dx: 0, dy: 200 },
                },
                ActionBinding {
                    label: 2,
                    action: Command::Scroll { dx: 0, dy: -200 },
                },
            ],
        }
    }
}

impl Configuration {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Configuration = toml::from_str(text).context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            bail!("num_classes must be at least 1");
        }
        if self.top_k == 0 {
            bail!("top_k must be at least 1");
        }
        if self.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be positive");
        }
        if self.thumbnail_side == 0 {
            bail!("thumbnail_side must be positive");
        }
        for (name, value) in [
            ("dispatch_threshold", self.dispatch_threshold),
            ("min_pose_confidence", self.min_pose_confidence),
            ("min_part_confidence", self.min_part_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be within [0, 1], got {value}");
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Configuration::from_toml_str("").unwrap();
        assert_eq!(config.num_classes, 7);
        assert_eq!(config.top_k, 10);
        assert_eq!(config.tick_interval(), Duration::from_millis(500));
        assert_eq!(config.actions.len(), 2);
    }

    #[test]
    fn parses_action_table_and_overrides() {
        let text = r#"
            num_classes = 4
            classifier_path = "model/classifiermodel.json"

            [[actions]]
            label = 3
            action = { kind = "scroll", dx = 0, dy = 400 }
        "#;
        let config = Configuration::from_toml_str(text).unwrap();
        assert_eq!(config.num_classes, 4);
        assert_eq!(
            config.classifier_path.as_deref(),
            Some(Path::new("model/classifiermodel.json"))
        );
        assert_eq!(
            config.actions,
            vec![ActionBinding {
                label: 3,
                action: Command::Scroll { dx: 0, dy: 400 },
            }]
        );
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = Configuration::from_toml_str("dispatch_threshold = 1.5").unwrap_err();
        assert!(format!("{err:#}").contains("dispatch_threshold"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.num_classes, 7);
    }
}
