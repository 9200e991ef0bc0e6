//! Built-in post-processor: sanity-check the materialized image.
//!
//! Walks the image tree for a file/byte tally, checks the launcher is a
//! real file and, when enabled, opens a session and smoke-runs the
//! launcher's version query. A well-formed launcher prints its version to
//! stderr and exits 0 with empty stdout.

use anyhow::{bail, Result};
use walkdir::WalkDir;

use crate::pipeline::PostProcessorStage;
use crate::session::SessionHub;

pub struct VerifyImage {
    run_launcher: bool,
}

impl VerifyImage {
    pub fn new() -> Self {
        Self { run_launcher: false }
    }

    /// Also launch the image's version query through a session.
    pub fn with_launcher_check(mut self) -> Self {
        self.run_launcher = true;
        self
    }
}

impl Default for VerifyImage {
    fn default() -> Self {
        Self::new()
    }
}

impl PostProcessorStage for VerifyImage {
    fn name(&self) -> &str {
        "verify-image"
    }

    fn process(&self, sessions: &SessionHub) -> Result<Option<String>> {
        let image = sessions.image();
        if !image.root().is_dir() {
            bail!("image root '{}' is not a directory", image.root().display());
        }

        let mut files = 0u64;
        let mut bytes = 0u64;
        for entry in WalkDir::new(image.root())
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.file_type().is_file() {
                files += 1;
                bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }

        if !image.launcher().is_file() {
            bail!(
                "launcher '{}' missing from image",
                image.launcher().display()
            );
        }

        if self.run_launcher {
            let session = sessions.new_session("verify");
            let process = session.new_image_process(["-version"])?;
            let output = process.wait_drained()?;
            session.close();
            if output.exit_code != 0 {
                bail!(
                    "launcher version query exited with {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                );
            }
        }

        Ok(Some(format!("{files} files, {bytes} bytes, launcher ok")))
    }
}
