//! TOML configuration for a link run.
//!
//! A `[link]` table names the target OS, the exclusion specifications
//! (inline patterns or pattern-file paths) and whether to verify the
//! materialized image. [`LinkConfig::assemble_pipeline`] turns a loaded
//! config into the standard stage list.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::pipeline::exclude::ExcludeFiles;
use crate::pipeline::platform::{PlatformHarmonizer, TargetOs};
use crate::pipeline::verify::VerifyImage;
use crate::pipeline::ImagePipeline;
use crate::pool::Resource;

/// Validated link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub target_os: TargetOs,
    pub exclude: Vec<String>,
    pub verify_image: bool,
    pub launcher_args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkToml {
    link: LinkTable,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkTable {
    target_os: String,
    exclude: Option<Vec<String>>,
    verify_image: Option<bool>,
    launcher_args: Option<Vec<String>>,
}

/// Load and validate a link config file.
pub fn load_link_config(path: &Path) -> Result<LinkConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading link config '{}'", path.display()))?;
    let parsed: LinkToml = toml::from_str(&text)
        .with_context(|| format!("parsing link config '{}'", path.display()))?;
    let table = parsed.link;

    let target_os = match table.target_os.trim().to_ascii_lowercase().as_str() {
        "linux" => TargetOs::Linux,
        "windows" => TargetOs::Windows,
        "macos" => TargetOs::MacOs,
        other => bail!(
            "invalid link config '{}': unsupported target_os '{}' (expected 'linux', 'windows' or 'macos')",
            path.display(),
            other
        ),
    };

    let exclude = table
        .exclude
        .unwrap_or_default()
        .into_iter()
        .map(|spec| spec.trim().to_string())
        .filter(|spec| !spec.is_empty())
        .collect();

    Ok(LinkConfig {
        target_os,
        exclude,
        verify_image: table.verify_image.unwrap_or(false),
        launcher_args: table.launcher_args.unwrap_or_default(),
    })
}

impl LinkConfig {
    /// Assemble the standard pipeline: one exclusion filter per spec, the
    /// platform harmonizer over `removed_entries`, and (when configured)
    /// the verify post-processor.
    pub fn assemble_pipeline(&self, removed_entries: &[Resource]) -> Result<ImagePipeline> {
        let mut pipeline = ImagePipeline::new();
        for spec in &self.exclude {
            pipeline.add_transformer(ExcludeFiles::new(spec)?);
        }
        pipeline.add_transformer(PlatformHarmonizer::from_removed_entries(
            self.target_os,
            removed_entries,
        ));
        if self.verify_image {
            pipeline.add_post_processor(VerifyImage::new().with_launcher_check());
        }
        Ok(pipeline)
    }
}
