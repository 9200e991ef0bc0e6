//! Stage model and the pipeline engine.
//!
//! A stage is one of two variants: a pool transformer (pool in, pool out,
//! before image materialization) or a post-processor (runs against the
//! materialized image through a session hub). Stages are grouped into
//! ordered categories; categories run in a fixed sequence and declared
//! order is kept inside each category.
//!
//! The engine threads a frozen pool through every transformer, allocating a
//! fresh output pool per stage, then hands the final pool to the
//! [`ImageWriter`] collaborator and runs post-processors against the result.

pub mod exclude;
pub mod platform;
pub mod verify;

use std::fmt;

use anyhow::{Context, Result};

use crate::image::{ExecutableImage, ImageWriter};
use crate::pool::ResourcePool;
use crate::report::{LinkReport, StageRecord};
use crate::session::SessionHub;

/// Execution categories, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum StageCategory {
    /// Entry filtering, before any per-file transformation.
    Filter = 1,
    /// Per-file transformation of surviving entries.
    Transform = 2,
    /// Runs against the materialized image.
    PostProcess = 3,
}

impl fmt::Display for StageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageCategory::Filter => write!(f, "filter"),
            StageCategory::Transform => write!(f, "transform"),
            StageCategory::PostProcess => write!(f, "post-process"),
        }
    }
}

/// A pool-to-pool stage. The input pool is frozen; the stage must account
/// for every input entry by forwarding, replacing or deliberately dropping
/// it into `output`.
pub trait TransformerStage {
    fn name(&self) -> &str;

    /// [`StageCategory::Filter`] or [`StageCategory::Transform`].
    fn category(&self) -> StageCategory {
        StageCategory::Transform
    }

    fn transform(&self, input: &ResourcePool, output: &mut ResourcePool) -> Result<()>;
}

/// A stage that runs after the image is on disk. May return a
/// human-readable log line for the run report.
pub trait PostProcessorStage {
    fn name(&self) -> &str;

    fn process(&self, sessions: &SessionHub) -> Result<Option<String>>;
}

/// One registered stage, either variant.
pub enum Stage {
    Transformer(Box<dyn TransformerStage>),
    PostProcessor(Box<dyn PostProcessorStage>),
}

impl Stage {
    pub fn name(&self) -> &str {
        match self {
            Stage::Transformer(stage) => stage.name(),
            Stage::PostProcessor(stage) => stage.name(),
        }
    }

    pub fn category(&self) -> StageCategory {
        match self {
            Stage::Transformer(stage) => stage.category(),
            Stage::PostProcessor(_) => StageCategory::PostProcess,
        }
    }
}

/// Result of a successful full run.
#[derive(Debug)]
pub struct LinkOutcome {
    pub pool: ResourcePool,
    pub image: ExecutableImage,
    pub report: LinkReport,
}

/// Ordered stage list plus the run loop.
#[derive(Default)]
pub struct ImagePipeline {
    stages: Vec<Stage>,
}

impl ImagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stage(&mut self, stage: Stage) -> &mut Self {
        self.stages.push(stage);
        self
    }

    pub fn add_transformer(&mut self, stage: impl TransformerStage + 'static) -> &mut Self {
        self.add_stage(Stage::Transformer(Box::new(stage)))
    }

    pub fn add_post_processor(&mut self, stage: impl PostProcessorStage + 'static) -> &mut Self {
        self.add_stage(Stage::PostProcessor(Box::new(stage)))
    }

    /// Stage names in declared order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Transformers in execution order: categories in their fixed sequence,
    /// declared order inside each category.
    fn ordered_transformers(&self) -> Vec<&dyn TransformerStage> {
        let mut stages: Vec<&dyn TransformerStage> = self
            .stages
            .iter()
            .filter_map(|stage| match stage {
                Stage::Transformer(t) => Some(t.as_ref()),
                Stage::PostProcessor(_) => None,
            })
            .collect();
        stages.sort_by_key(|stage| stage.category());
        stages
    }

    fn post_processors(&self) -> impl Iterator<Item = &dyn PostProcessorStage> {
        self.stages.iter().filter_map(|stage| match stage {
            Stage::PostProcessor(p) => Some(p.as_ref()),
            Stage::Transformer(_) => None,
        })
    }

    /// Thread `initial` through every transformer. A stage failure aborts
    /// the run; nothing is materialized. Returns the final frozen pool and
    /// per-stage accounting.
    pub fn run_transforms(
        &self,
        initial: ResourcePool,
    ) -> Result<(ResourcePool, Vec<StageRecord>)> {
        let mut current = initial;
        current.freeze();

        let mut records = Vec::new();
        for stage in self.ordered_transformers() {
            let entries_in = current.len();
            let mut output = ResourcePool::new();
            stage
                .transform(&current, &mut output)
                .with_context(|| format!("stage '{}' failed", stage.name()))?;
            output.freeze();
            records.push(StageRecord {
                name: stage.name().to_string(),
                category: stage.category().to_string(),
                entries_in,
                entries_out: output.len(),
            });
            current = output;
        }
        Ok((current, records))
    }

    /// Full run: transforms, materialization through `writer`, then
    /// post-processors. A post-processor failure stops the remaining
    /// post-processors and is returned as the run error, but the
    /// already-materialized image stays on disk, with the run report
    /// recording the failure.
    pub fn run(&self, initial: ResourcePool, writer: &dyn ImageWriter) -> Result<LinkOutcome> {
        let mut report = LinkReport::begin();

        let (pool, records) = self.run_transforms(initial)?;
        report.stages = records;
        report.pool_sha256 = pool.fingerprint();

        let image = writer.write_image(&pool).context("materializing image")?;
        report.image_root = Some(image.root().display().to_string());

        let sessions = SessionHub::new(image.clone());
        let mut failure = None;
        for stage in self.post_processors() {
            match stage.process(&sessions) {
                Ok(Some(log)) => {
                    println!("{}: {log}", stage.name());
                    report.post_process_logs.push(format!("{}: {log}", stage.name()));
                }
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e.context(format!("post-processor '{}' failed", stage.name())));
                    break;
                }
            }
        }

        report.finish(if failure.is_some() {
            "post-processing-failed"
        } else {
            "success"
        });
        report.write_to(image.root()).context("writing link report")?;

        match failure {
            Some(e) => Err(e),
            None => Ok(LinkOutcome {
                pool,
                image,
                report,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Resource, ResourceKind};
    use crate::report::REPORT_FILENAME;
    use anyhow::bail;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn entry(module: &str, path: &str) -> Resource {
        Resource::new(module, path, ResourceKind::Content, path.as_bytes().to_vec()).unwrap()
    }

    fn sample_pool() -> ResourcePool {
        let mut pool = ResourcePool::new();
        pool.add(entry("m", "/a")).unwrap();
        pool.add(entry("m", "/b")).unwrap();
        pool
    }

    /// Forwards everything and records when it ran.
    struct Probe {
        label: &'static str,
        category: StageCategory,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl TransformerStage for Probe {
        fn name(&self) -> &str {
            self.label
        }

        fn category(&self) -> StageCategory {
            self.category
        }

        fn transform(&self, input: &ResourcePool, output: &mut ResourcePool) -> Result<()> {
            self.log.lock().unwrap().push(self.label);
            input.visit(&mut |r: &Resource| Ok(Some(r.clone())), output)
        }
    }

    struct FailingStage;

    impl TransformerStage for FailingStage {
        fn name(&self) -> &str {
            "failing"
        }

        fn transform(&self, _input: &ResourcePool, _output: &mut ResourcePool) -> Result<()> {
            bail!("boom");
        }
    }

    /// Writes every entry under a temp root; the launcher path is declared
    /// but only exists when a test creates it.
    struct DirWriter {
        root: std::path::PathBuf,
        called: AtomicBool,
    }

    impl DirWriter {
        fn new(root: std::path::PathBuf) -> Self {
            Self {
                root,
                called: AtomicBool::new(false),
            }
        }
    }

    impl ImageWriter for DirWriter {
        fn write_image(&self, pool: &ResourcePool) -> Result<ExecutableImage> {
            self.called.store(true, Ordering::SeqCst);
            fs::create_dir_all(&self.root)?;
            for resource in pool.contents() {
                let rel = resource.path().trim_start_matches('/');
                let dest = self.root.join(resource.module()).join(rel);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&dest, resource.bytes())?;
            }
            Ok(ExecutableImage::new(&self.root, self.root.join("bin/run")))
        }
    }

    struct LoggingPost {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl PostProcessorStage for LoggingPost {
        fn name(&self) -> &str {
            self.label
        }

        fn process(&self, _sessions: &SessionHub) -> Result<Option<String>> {
            self.log.lock().unwrap().push(self.label);
            if self.fail {
                bail!("post boom");
            }
            Ok(Some("done".to_string()))
        }
    }

    #[test]
    fn categories_run_in_fixed_sequence_keeping_declared_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = ImagePipeline::new();
        pipeline.add_transformer(Probe {
            label: "transform-1",
            category: StageCategory::Transform,
            log: Arc::clone(&log),
        });
        pipeline.add_transformer(Probe {
            label: "filter-1",
            category: StageCategory::Filter,
            log: Arc::clone(&log),
        });
        pipeline.add_transformer(Probe {
            label: "transform-2",
            category: StageCategory::Transform,
            log: Arc::clone(&log),
        });
        pipeline.add_transformer(Probe {
            label: "filter-2",
            category: StageCategory::Filter,
            log: Arc::clone(&log),
        });

        pipeline.run_transforms(sample_pool()).unwrap();
        let order = log.lock().unwrap().clone();
        assert_eq!(order, ["filter-1", "filter-2", "transform-1", "transform-2"]);
    }

    #[test]
    fn stage_failure_aborts_before_materialization() {
        let tmp = TempDir::new().unwrap();
        let writer = DirWriter::new(tmp.path().join("image"));

        let mut pipeline = ImagePipeline::new();
        pipeline.add_transformer(FailingStage);

        let err = pipeline.run(sample_pool(), &writer).unwrap_err();
        assert!(format!("{err:#}").contains("stage 'failing' failed"));
        assert!(!writer.called.load(Ordering::SeqCst));
        assert!(!tmp.path().join("image").exists());
    }

    #[test]
    fn successful_run_writes_report_with_accounting() {
        let tmp = TempDir::new().unwrap();
        let writer = DirWriter::new(tmp.path().join("image"));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut pipeline = ImagePipeline::new();
        pipeline.add_transformer(Probe {
            label: "forward",
            category: StageCategory::Transform,
            log: Arc::clone(&log),
        });
        pipeline.add_post_processor(LoggingPost {
            label: "announce",
            log: Arc::clone(&log),
            fail: false,
        });

        let outcome = pipeline.run(sample_pool(), &writer).unwrap();
        assert_eq!(outcome.pool.len(), 2);
        assert_eq!(outcome.report.status, "success");
        assert_eq!(outcome.report.stages.len(), 1);
        assert_eq!(outcome.report.stages[0].entries_in, 2);
        assert_eq!(outcome.report.stages[0].entries_out, 2);
        assert_eq!(outcome.report.pool_sha256, outcome.pool.fingerprint());
        assert_eq!(outcome.report.post_process_logs, ["announce: done"]);

        let report_path = tmp.path().join("image").join(REPORT_FILENAME);
        assert!(report_path.is_file());
        assert!(tmp.path().join("image/m/a").is_file());
    }

    #[test]
    fn post_failure_stops_later_posts_but_keeps_image() {
        let tmp = TempDir::new().unwrap();
        let writer = DirWriter::new(tmp.path().join("image"));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut pipeline = ImagePipeline::new();
        pipeline.add_post_processor(LoggingPost {
            label: "first",
            log: Arc::clone(&log),
            fail: true,
        });
        pipeline.add_post_processor(LoggingPost {
            label: "second",
            log: Arc::clone(&log),
            fail: false,
        });

        let err = pipeline.run(sample_pool(), &writer).unwrap_err();
        assert!(format!("{err:#}").contains("post-processor 'first' failed"));
        assert_eq!(log.lock().unwrap().clone(), ["first"]);

        // Image and report survive the post-processing failure.
        assert!(tmp.path().join("image/m/a").is_file());
        let report =
            LinkReport::load(&tmp.path().join("image").join(REPORT_FILENAME)).unwrap();
        assert_eq!(report.status, "post-processing-failed");
    }

    #[test]
    #[cfg(unix)]
    fn full_link_run_excludes_harmonizes_and_verifies() {
        use crate::pipeline::exclude::ExcludeFiles;
        use crate::pipeline::platform::{PlatformHarmonizer, TargetOs, ENGINE_CFG};
        use crate::pipeline::verify::VerifyImage;
        use std::os::unix::fs::PermissionsExt;

        struct LauncherWriter {
            root: std::path::PathBuf,
        }

        impl ImageWriter for LauncherWriter {
            fn write_image(&self, pool: &ResourcePool) -> Result<ExecutableImage> {
                fs::create_dir_all(self.root.join("bin"))?;
                for resource in pool.contents() {
                    let dest = self.root.join(resource.path().trim_start_matches('/'));
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&dest, resource.bytes())?;
                }
                let launcher = self.root.join("bin/run");
                fs::write(
                    &launcher,
                    "#!/bin/sh\necho \"engine runtime 1.0\" >&2\nexit 0\n",
                )?;
                let mut perms = fs::metadata(&launcher)?.permissions();
                perms.set_mode(0o755);
                fs::set_permissions(&launcher, perms)?;
                Ok(ExecutableImage::new(&self.root, launcher))
            }
        }

        let build_pool = || {
            let mut pool = ResourcePool::new();
            for platform in ["server", "client", "minimal"] {
                pool.add(
                    Resource::new(
                        "runtime",
                        format!("/lib/{platform}/libengine.so"),
                        ResourceKind::NativeLib,
                        b"elf".to_vec(),
                    )
                    .unwrap(),
                )
                .unwrap();
            }
            pool.add(
                Resource::new(
                    "runtime",
                    format!("/lib/{ENGINE_CFG}"),
                    ResourceKind::Config,
                    b"# platform selection\n-server KNOWN\n-client KNOWN\n-minimal KNOWN\n"
                        .to_vec(),
                )
                .unwrap(),
            )
            .unwrap();
            pool
        };

        let tmp = TempDir::new().unwrap();
        let run = |dir: &str| {
            let pool = build_pool();
            let removed: Vec<Resource> = pool
                .contents()
                .filter(|r| r.path().starts_with("/lib/client/"))
                .cloned()
                .collect();

            let mut pipeline = ImagePipeline::new();
            pipeline.add_transformer(ExcludeFiles::new("/runtime/lib/client/*").unwrap());
            pipeline.add_transformer(PlatformHarmonizer::from_removed_entries(
                TargetOs::Linux,
                removed.iter(),
            ));
            pipeline.add_post_processor(VerifyImage::new().with_launcher_check());

            let writer = LauncherWriter {
                root: tmp.path().join(dir),
            };
            pipeline.run(pool, &writer).unwrap()
        };

        let first = run("image-a");
        let second = run("image-b");

        assert_eq!(first.report.status, "success");
        assert!(first.pool.contains("runtime", "/lib/server/libengine.so"));
        assert!(!first.pool.contains("runtime", "/lib/client/libengine.so"));

        let cfg_a =
            fs::read_to_string(tmp.path().join("image-a/lib").join(ENGINE_CFG)).unwrap();
        let cfg_b =
            fs::read_to_string(tmp.path().join("image-b/lib").join(ENGINE_CFG)).unwrap();
        assert_eq!(cfg_a, cfg_b);
        assert_eq!(
            cfg_a,
            "# platform selection\n-server KNOWN\n-minimal KNOWN\n-client ALIASED_TO -server\n"
        );
        assert_eq!(first.pool.fingerprint(), second.pool.fingerprint());
    }

    #[test]
    fn two_runs_over_the_same_pool_are_deterministic() {
        let tmp = TempDir::new().unwrap();

        let run = |dir: &str| {
            let writer = DirWriter::new(tmp.path().join(dir));
            let mut pipeline = ImagePipeline::new();
            pipeline.add_transformer(Probe {
                label: "forward",
                category: StageCategory::Transform,
                log: Arc::new(Mutex::new(Vec::new())),
            });
            pipeline.run(sample_pool(), &writer).unwrap()
        };

        let first = run("image-a");
        let second = run("image-b");
        assert_eq!(first.pool.fingerprint(), second.pool.fingerprint());
        assert_eq!(first.report.pool_sha256, second.report.pool_sha256);
    }
}
