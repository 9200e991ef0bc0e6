//! Entry filtering over exclusion patterns.

use anyhow::Result;

use crate::error::LinkError;
use crate::pattern::PatternSet;
use crate::pipeline::{StageCategory, TransformerStage};
use crate::pool::{Resource, ResourcePool};

/// Filter stage dropping every entry matched by its pattern set.
pub struct ExcludeFiles {
    patterns: PatternSet,
}

impl ExcludeFiles {
    /// `spec` is one inline pattern, or the path of a file of newline-
    /// separated patterns.
    pub fn new(spec: &str) -> Result<Self, LinkError> {
        Ok(Self {
            patterns: PatternSet::parse(spec)?,
        })
    }

    pub fn from_patterns(patterns: PatternSet) -> Self {
        Self { patterns }
    }
}

impl TransformerStage for ExcludeFiles {
    fn name(&self) -> &str {
        "exclude-files"
    }

    fn category(&self) -> StageCategory {
        StageCategory::Filter
    }

    fn transform(&self, input: &ResourcePool, output: &mut ResourcePool) -> Result<()> {
        input.visit(
            &mut |resource: &Resource| {
                if self.patterns.matches_resource(resource) {
                    Ok(None)
                } else {
                    Ok(Some(resource.clone()))
                }
            },
            output,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ResourceKind;

    fn entry(module: &str, path: &str) -> Resource {
        Resource::new(module, path, ResourceKind::Content, Vec::from(path)).unwrap()
    }

    fn run_stage(stage: &ExcludeFiles, pool: &ResourcePool) -> ResourcePool {
        let mut output = ResourcePool::new();
        stage.transform(pool, &mut output).unwrap();
        output
    }

    #[test]
    fn drops_matches_and_forwards_the_rest() {
        let mut pool = ResourcePool::new();
        pool.add(entry("java.base", "/num/toto.jcov")).unwrap();
        pool.add(entry("java.base", "/lib/tools.cfg")).unwrap();
        pool.add(entry("other", "/deep/nested/trace.jcov")).unwrap();

        let stage = ExcludeFiles::new("*.jcov").unwrap();
        let output = run_stage(&stage, &pool);

        assert_eq!(output.len(), 1);
        assert!(output.contains("java.base", "/lib/tools.cfg"));
    }

    #[test]
    fn module_qualified_pattern_only_touches_that_module() {
        let mut pool = ResourcePool::new();
        pool.add(entry("java.base", "/toto.jcov")).unwrap();
        pool.add(entry("java.desktop", "/toto.jcov")).unwrap();

        let stage = ExcludeFiles::new("/java.base/*.jcov").unwrap();
        let output = run_stage(&stage, &pool);

        assert_eq!(output.len(), 1);
        assert!(output.contains("java.desktop", "/toto.jcov"));
    }

    #[test]
    fn every_input_entry_is_accounted_for() {
        let mut pool = ResourcePool::new();
        for i in 0..10 {
            let path = if i % 2 == 0 {
                format!("/gen/file{i}.jcov")
            } else {
                format!("/gen/file{i}.txt")
            };
            pool.add(entry("m", &path)).unwrap();
        }

        let stage = ExcludeFiles::new("*.jcov").unwrap();
        let output = run_stage(&stage, &pool);

        for resource in pool.contents() {
            let kept = output.contains(resource.module(), resource.path());
            let matched = resource.path().ends_with(".jcov");
            assert_eq!(kept, !matched, "entry {resource} misaccounted");
        }
        assert_eq!(output.len(), 5);
    }
}
