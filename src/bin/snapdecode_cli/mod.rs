//! CLI subcommand implementations for snapdecode

pub mod index;
pub mod locks;
pub mod output;
pub mod queues;

use std::path::Path;

use anyhow::{Context, Result};
use snapdecode_core::{DecoderConfig, SnapshotImage, Target};
use tracing::debug;

/// A loaded snapshot plus the decoder configuration for this run.
pub struct Session {
    pub image: SnapshotImage,
    pub config: DecoderConfig,
}

impl Session {
    /// Load the image, then the config from `--config` or `SNAPDECODE_CONFIG`.
    pub fn load(image: &Path, config: Option<&Path>) -> Result<Self> {
        let image = SnapshotImage::from_json_file(image)
            .with_context(|| format!("failed to load snapshot image {}", image.display()))?;
        let config = match config {
            Some(path) => DecoderConfig::from_json_file(path)?.with_env_overrides(),
            None => DecoderConfig::load()?,
        };
        debug!(?config, "session loaded");
        Ok(Self { image, config })
    }

    pub fn target(&self) -> Target<'_> {
        Target::from_snapshot(&self.image)
    }
}
