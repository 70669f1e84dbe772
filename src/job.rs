use std::path::{Path, PathBuf};

use anyhow::Context;
use compose_bus::{
    composition::Composition,
    config::{ComposeConfig, default_config},
    encoder::ExportSettings,
};
use serde::Deserialize;

/// Everything one export run needs, as read from the job file.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportJob {
    pub composition: Composition,
    pub output: PathBuf,
    #[serde(default)]
    pub settings: ExportSettings,
    #[serde(default = "engine_defaults")]
    pub config: ComposeConfig,
}

fn engine_defaults() -> ComposeConfig {
    default_config().clone()
}

impl ExportJob {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading job file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid job file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let job: Self = serde_json::from_str(text)?;
        job.composition.validate()?;
        job.config.validate()?;
        let video = &job.settings.video;
        anyhow::ensure!(video.frame_rate > 0, "frame rate must be positive");
        anyhow::ensure!(
            video.width > 0 && video.height > 0 && video.width % 2 == 0 && video.height % 2 == 0,
            "output size {}x{} must be positive and even",
            video.width,
            video.height
        );
        anyhow::ensure!(
            matches!(job.settings.audio.channels, 1 | 2),
            "audio must be mono or stereo"
        );
        Ok(job)
    }
}
