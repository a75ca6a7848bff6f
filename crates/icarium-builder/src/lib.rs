//! Build pipeline for the icarium image builder.
//!
//! Runs one build end to end:
//! - Allocates an ephemeral workspace
//! - Checks out the exact pushed commit
//! - Builds and pushes the container image
//! - Removes the workspace, whatever the outcome

pub mod command;
pub mod error;
pub mod pipeline;
pub mod workspace;

pub use command::{CommandError, CommandRunner, ProcessRunner, ToolCommand};
pub use error::{BuildStage, PipelineError, PipelineResult};
pub use pipeline::{BuildPipeline, BuiltImage};
pub use workspace::Workspace;
