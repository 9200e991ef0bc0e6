//! Platform model and the harmonizer stage.
//!
//! An image bundles one or more platform variants of the native execution
//! engine, each under a directory named after the platform, next to a
//! single `engine.cfg` resource describing which variants a launcher may
//! select. When a filtering stage removes some variants, the config has to
//! be rewritten so every pre-removal platform still resolves: retained ones
//! stay `KNOWN`, removed ones are aliased to the first retained platform in
//! priority order.
//!
//! The target operating system is an injected value, never a host probe, so
//! the harmonizer is testable for all three library naming schemes on any
//! host.

use anyhow::{Context, Result};

use crate::error::LinkError;
use crate::pipeline::{StageCategory, TransformerStage};
use crate::pool::{Resource, ResourcePool};

/// File name of the platform selection config inside the image.
pub const ENGINE_CFG: &str = "engine.cfg";

/// Operating system the image is linked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Linux,
    Windows,
    MacOs,
}

impl TargetOs {
    /// File name of the native engine library on this OS.
    pub fn engine_lib_name(self) -> &'static str {
        match self {
            TargetOs::Linux => "libengine.so",
            TargetOs::Windows => "engine.dll",
            TargetOs::MacOs => "libengine.dylib",
        }
    }
}

/// The known platform variants, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Server,
    Client,
    Minimal,
}

impl Platform {
    pub fn from_name(name: &str) -> Result<Self, LinkError> {
        match name {
            "server" => Ok(Platform::Server),
            "client" => Ok(Platform::Client),
            "minimal" => Ok(Platform::Minimal),
            other => Err(LinkError::Lookup(format!("unknown platform '{other}'"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Platform::Server => "server",
            Platform::Client => "client",
            Platform::Minimal => "minimal",
        }
    }

    /// Lower sorts first when choosing an alias target.
    pub fn priority(self) -> u8 {
        match self {
            Platform::Server => 0,
            Platform::Client => 1,
            Platform::Minimal => 2,
        }
    }
}

/// Transform stage rewriting `engine.cfg` after platform variants were
/// removed from the image.
pub struct PlatformHarmonizer {
    target: TargetOs,
    removed: Vec<String>,
}

impl PlatformHarmonizer {
    /// `removed` names the platform variants dropped by earlier stages.
    pub fn new(target: TargetOs, removed: Vec<String>) -> Self {
        Self { target, removed }
    }

    /// Derive the removed platform names by scanning dropped entries for
    /// native engine libraries.
    pub fn from_removed_entries<'a>(
        target: TargetOs,
        removed: impl IntoIterator<Item = &'a Resource>,
    ) -> Self {
        let lib = target.engine_lib_name();
        let removed = removed
            .into_iter()
            .filter_map(|resource| platform_of(resource, lib))
            .collect();
        Self { target, removed }
    }
}

impl TransformerStage for PlatformHarmonizer {
    fn name(&self) -> &str {
        "platform-harmonizer"
    }

    fn category(&self) -> StageCategory {
        StageCategory::Transform
    }

    fn transform(&self, input: &ResourcePool, output: &mut ResourcePool) -> Result<()> {
        // Nothing was removed: the pool passes through untouched and the
        // discovery visit is skipped.
        if self.removed.is_empty() {
            return input.visit(&mut |r: &Resource| Ok(Some(r.clone())), output);
        }

        let lib = self.target.engine_lib_name();
        let mut existing: Vec<String> = Vec::new();
        let mut holders: Vec<Resource> = Vec::new();
        input.visit(
            &mut |resource: &Resource| {
                if resource.file_name() == ENGINE_CFG {
                    // Divert the config out of the forwarded stream; it is
                    // regenerated below.
                    holders.push(resource.clone());
                    return Ok(None);
                }
                if let Some(platform) = platform_of(resource, lib) {
                    existing.push(platform);
                }
                Ok(Some(resource.clone()))
            },
            output,
        )?;

        if existing.is_empty() {
            return Err(LinkError::Configuration(
                "no platform found, image must contain at least one".to_string(),
            )
            .into());
        }

        if holders.len() != 1 {
            eprintln!(
                "platform-harmonizer: expected one {ENGINE_CFG} resource, found {}; skipping rewriting",
                holders.len()
            );
            for holder in holders {
                output.add(holder)?;
            }
            return Ok(());
        }

        let rewritten = rewrite_config(&holders[0], &existing, &self.removed)?;
        output.add(rewritten)?;
        Ok(())
    }
}

/// Platform a native engine library belongs to: the name of its parent
/// directory, when the final path segment is the engine library.
fn platform_of(resource: &Resource, lib_name: &str) -> Option<String> {
    if resource.file_name() != lib_name {
        return None;
    }
    match resource.parent_dir_name() {
        Some(dir) => Some(dir.to_string()),
        None => {
            eprintln!(
                "platform-harmonizer: engine library '{}' not inside a platform directory",
                resource.path()
            );
            None
        }
    }
}

fn rewrite_config(original: &Resource, existing: &[String], removed: &[String]) -> Result<Resource> {
    let text = std::str::from_utf8(original.bytes())
        .with_context(|| format!("config resource '{}' is not UTF-8", original.path()))?;

    // Comments first, verbatim and in original order.
    let mut buf = String::new();
    for line in text.lines() {
        if line.starts_with('#') {
            buf.push_str(line);
            buf.push('\n');
        }
    }

    let mut platforms = existing
        .iter()
        .map(|name| Platform::from_name(name))
        .collect::<Result<Vec<_>, _>>()?;
    platforms.sort_by_key(|p| p.priority());
    platforms.dedup();

    let retained: Vec<Platform> = platforms
        .into_iter()
        .filter(|p| !removed.iter().any(|name| name == p.name()))
        .collect();
    for platform in &retained {
        buf.push_str(&format!("-{} KNOWN\n", platform.name()));
    }

    let alias_target = retained.first().ok_or_else(|| {
        LinkError::Configuration(
            "every discovered platform was removed, nothing left to alias against".to_string(),
        )
    })?;
    for name in removed {
        buf.push_str(&format!("-{name} ALIASED_TO -{}\n", alias_target.name()));
    }

    Ok(original.with_bytes(buf.into_bytes()))
}
