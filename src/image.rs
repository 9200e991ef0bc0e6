//! Handle over a materialized runtime image.
//!
//! Materialization itself, turning a final pool into a filesystem layout,
//! is a collaborator behind [`ImageWriter`]. The pipeline only needs the
//! resulting [`ExecutableImage`]: where the image root is and how to launch
//! the runtime inside it.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::pool::ResourcePool;

/// A materialized image on disk: root directory, launcher binary and the
/// fixed arguments the launcher always receives.
#[derive(Debug, Clone)]
pub struct ExecutableImage {
    root: PathBuf,
    launcher: PathBuf,
    launcher_args: Vec<String>,
}

impl ExecutableImage {
    pub fn new(root: impl Into<PathBuf>, launcher: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            launcher: launcher.into(),
            launcher_args: Vec::new(),
        }
    }

    /// Fixed arguments prepended to every launcher invocation.
    pub fn with_launcher_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.launcher_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn launcher(&self) -> &Path {
        &self.launcher
    }

    pub fn launcher_args(&self) -> &[String] {
        &self.launcher_args
    }
}

/// Materialization collaborator: consumes the final pool, produces an image
/// root with a platform-appropriate launcher.
pub trait ImageWriter {
    fn write_image(&self, pool: &ResourcePool) -> Result<ExecutableImage>;
}
