//! Shared infrastructure for assembling and validating self-contained
//! runtime images.
//!
//! rtlink turns a pool of module resources into a trimmed,
//! platform-harmonized runtime image by threading the pool through an
//! ordered chain of stages, then validates the materialized image by
//! launching it:
//!
//! - **Resource pool** - insertion-ordered, freeze-on-handoff collection of
//!   typed binary entries with a visitor-based transform contract
//! - **Pipeline engine** - Filter / Transform / PostProcess categories,
//!   declared order kept inside each category, one frozen pool per stage
//! - **Exclusion matcher** - `*`-glob path patterns with optional module
//!   qualifiers, inline or loaded from a pattern file
//! - **Platform harmonizer** - rewrites the engine platform config when
//!   platform variants are removed from the image
//! - **Sessions** - named process scopes that launch the built image,
//!   drain both standard streams without pipe deadlock and expose blocking
//!   and non-blocking exit-status retrieval
//!
//! # Architecture
//!
//! ```text
//! ingestion (external)          materialization (external)
//!        |                               |
//!        v                               v
//!   ResourcePool --> ImagePipeline --> ImageWriter --> ExecutableImage
//!                     Filter stages                        |
//!                     Transform stages                     v
//!                     PostProcess stages <------------ SessionHub
//! ```
//!
//! Module ingestion, the wider built-in plugin set, command-line parsing
//! and the on-disk image layout are collaborators behind the contracts in
//! [`image`]; this crate supplies the pipeline between them.

pub mod config;
pub mod error;
pub mod image;
pub mod pattern;
pub mod pipeline;
pub mod pool;
pub mod report;
pub mod session;

pub use config::{load_link_config, LinkConfig};
pub use error::LinkError;
pub use image::{ExecutableImage, ImageWriter};
pub use pattern::PatternSet;
pub use pipeline::exclude::ExcludeFiles;
pub use pipeline::platform::{Platform, PlatformHarmonizer, TargetOs, ENGINE_CFG};
pub use pipeline::verify::VerifyImage;
pub use pipeline::{
    ImagePipeline, LinkOutcome, PostProcessorStage, Stage, StageCategory, TransformerStage,
};
pub use pool::{Resource, ResourceKind, ResourcePool, ResourceVisitor};
pub use report::{LinkReport, StageRecord, REPORT_FILENAME};
pub use session::{CancelToken, LaunchSpec, ProcessOutput, RunningProcess, Session, SessionHub};
