//! Checkout, image build and image push for one triggered build.

use crate::command::{CommandRunner, ToolCommand};
use crate::error::{PipelineError, PipelineResult};
use crate::workspace::Workspace;
use icarium_config::BuilderConfig;
use icarium_core::{BuildCredential, BuildId, BuildRule, BuildTriggerEvent, RepositoryConfig};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// An image produced by a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// Full reference, e.g. `registry.example.com/widget:v2.0.0`.
    pub reference: String,
    /// False when no registry is configured and the push was skipped.
    pub pushed: bool,
}

/// Runs the external build tools for one event.
pub struct BuildPipeline {
    config: BuilderConfig,
    runner: Arc<dyn CommandRunner>,
    timeout: Option<Duration>,
}

impl BuildPipeline {
    pub fn new(config: BuilderConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            timeout: None,
        }
    }

    /// Bound the checkout, build and push steps. Cleanup runs after the deadline.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build and publish `event.commit` according to `rule`.
    ///
    /// Steps run strictly in order and stop at the first failure. The
    /// workspace is removed on every path once it has been allocated.
    pub async fn build(
        &self,
        id: BuildId,
        repository: &RepositoryConfig,
        rule: &BuildRule,
        event: &BuildTriggerEvent,
        credential: Option<&BuildCredential>,
    ) -> PipelineResult<BuiltImage> {
        let credential = credential
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PipelineError::MissingCredential(repository.owner_username.clone()))?;

        let (owner, name) = event.repository_parts()?;
        let tag = rule.effective_image_tag(&event.ref_name()?)?;
        validate_commit(&event.commit)?;
        let image = self.image_reference(name, &tag);

        let workspace = Workspace::create(&self.config.work_dir, owner, name, id)
            .await
            .map_err(PipelineError::Workspace)?;

        let steps = self.run_steps(workspace.path(), rule, event, credential, &image);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, steps)
                .await
                .unwrap_or(Err(PipelineError::Timeout(limit))),
            None => steps.await,
        };

        let path = workspace.path().to_path_buf();
        match (result, workspace.release().await) {
            (Ok(built), Ok(())) => Ok(built),
            (Ok(_), Err(e)) => Err(PipelineError::Workspace(e)),
            (Err(err), release) => {
                if let Err(e) = release {
                    warn!(build_id = %id, path = %path.display(), error = %e, "Failed to remove workspace");
                }
                Err(err)
            }
        }
    }

    async fn run_steps(
        &self,
        workspace: &Path,
        rule: &BuildRule,
        event: &BuildTriggerEvent,
        credential: &BuildCredential,
        image: &str,
    ) -> PipelineResult<BuiltImage> {
        info!(
            repo = %event.repository_full_name,
            commit = %event.commit,
            path = %workspace.display(),
            "Checking out commit"
        );
        self.checkout(workspace, event, credential).await?;

        info!(image = %image, "Building image");
        let build = self.image_build_command(workspace, image, &rule.dockerfile_location)?;
        self.runner
            .run(&build)
            .await
            .map_err(|e| PipelineError::ImageBuild(e.to_string()))?;

        if self.config.registry.is_none() {
            info!(image = %image, "No registry configured, skipping push");
            return Ok(BuiltImage {
                reference: image.to_string(),
                pushed: false,
            });
        }

        info!(image = %image, "Pushing image");
        let push = ToolCommand::new(&self.config.docker).args(["push", image]);
        self.runner
            .run(&push)
            .await
            .map_err(|e| PipelineError::ImagePush(e.to_string()))?;

        Ok(BuiltImage {
            reference: image.to_string(),
            pushed: true,
        })
    }

    /// Clone the repository and detach at the exact commit.
    ///
    /// The token reaches git only through the environment of the clone, via
    /// a credential helper. It never appears in argv or in `.git/config`.
    async fn checkout(
        &self,
        workspace: &Path,
        event: &BuildTriggerEvent,
        credential: &BuildCredential,
    ) -> PipelineResult<()> {
        let url = self.clone_url(&event.repository_full_name)?;

        let workspace_arg = workspace.to_string_lossy().to_string();
        let commands = [
            with_credential_helper(self.git(), credential)
                .args(["clone", "--quiet", "--no-checkout", url.as_str()])
                .arg(workspace_arg),
            self.git()
                .args(["checkout", "--quiet", "--detach", event.commit.as_str(), "--"])
                .current_dir(workspace),
        ];

        for command in &commands {
            self.runner
                .run(command)
                .await
                .map_err(|e| checkout_error(credential, e))?;
        }

        Ok(())
    }

    fn git(&self) -> ToolCommand {
        ToolCommand::new(&self.config.git).env("GIT_TERMINAL_PROMPT", "0")
    }

    fn clone_url(&self, full_name: &str) -> PipelineResult<Url> {
        let raw = format!("https://{}/{}.git", self.config.github_host, full_name);
        Url::parse(&raw).map_err(|e| {
            PipelineError::InvalidRequest(icarium_core::Error::InvalidInput(format!(
                "invalid clone URL {}: {}",
                raw, e
            )))
        })
    }

    /// Image names must be lowercase; tags keep their case.
    fn image_reference(&self, name: &str, tag: &str) -> String {
        let name = name.to_lowercase();
        match &self.config.registry {
            Some(registry) => format!("{}/{}:{}", registry, name, tag),
            None => format!("{}:{}", name, tag),
        }
    }

    /// `docker build` invocation for the rule's Dockerfile location.
    ///
    /// An empty location (or `/`) builds the repository root. A directory is
    /// used as the build context; anything else is treated as the Dockerfile
    /// path with the repository root as context.
    fn image_build_command(
        &self,
        workspace: &Path,
        image: &str,
        dockerfile_location: &str,
    ) -> PipelineResult<ToolCommand> {
        let command = ToolCommand::new(&self.config.docker).args(["build", "-t", image]);

        let relative = dockerfile_location.trim_start_matches('/');
        if relative.is_empty() {
            return Ok(command.arg(workspace.to_string_lossy()));
        }

        let relative = PathBuf::from(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(PipelineError::ImageBuild(format!(
                "dockerfile location '{}' escapes the repository",
                dockerfile_location
            )));
        }

        let target = workspace.join(&relative);
        if target.is_dir() {
            Ok(command.arg(target.to_string_lossy()))
        } else {
            Ok(command
                .arg("-f")
                .arg(target.to_string_lossy())
                .arg(workspace.to_string_lossy()))
        }
    }
}

/// Environment variable the credential helper reads the token from.
const TOKEN_ENV: &str = "ICARIUM_GIT_TOKEN";

/// Answers `get` requests with the token from [`TOKEN_ENV`]. The variable is
/// expanded by the helper's shell, not by us.
const CREDENTIAL_HELPER: &str = "!f() { if [ \"$1\" = get ]; then echo username=x-access-token; echo \"password=${ICARIUM_GIT_TOKEN}\"; fi; }; f";

/// Install the token helper through `GIT_CONFIG_*` so no config file is
/// written. The empty first entry clears helpers from the user's config.
fn with_credential_helper(command: ToolCommand, credential: &BuildCredential) -> ToolCommand {
    command
        .env("GIT_CONFIG_COUNT", "2")
        .env("GIT_CONFIG_KEY_0", "credential.helper")
        .env("GIT_CONFIG_VALUE_0", "")
        .env("GIT_CONFIG_KEY_1", "credential.helper")
        .env("GIT_CONFIG_VALUE_1", CREDENTIAL_HELPER)
        .env(TOKEN_ENV, credential.expose())
}

fn checkout_error(credential: &BuildCredential, err: impl ToString) -> PipelineError {
    PipelineError::Checkout(credential.redact(&err.to_string()))
}

fn validate_commit(commit: &str) -> PipelineResult<()> {
    if commit.is_empty() || commit.starts_with('-') || commit.chars().any(char::is_whitespace) {
        return Err(PipelineError::InvalidRequest(
            icarium_core::Error::InvalidInput(format!("invalid commit '{}'", commit)),
        ));
    }
    Ok(())
}
