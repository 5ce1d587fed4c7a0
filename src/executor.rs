use crate::config::BuildConfig;
use crate::traits::{BuildError, BuildStatus, PackageBuilder};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

/// Runs an external build command inside the package directory.
pub struct CommandBuilder {
    program: String,
    args: Vec<String>,
    build_timeout: Duration,
}

impl CommandBuilder {
    /// Default timeout: 5 minutes per build.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            build_timeout: Duration::from_secs(300),
        }
    }

    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
            .with_timeout(Duration::from_secs(config.timeout_secs))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }
}

#[async_trait]
impl PackageBuilder for CommandBuilder {
    fn builder_name(&self) -> &str {
        &self.program
    }

    #[instrument(skip(self), fields(program = %self.program))]
    async fn build(&self, package_dir: &Path) -> Result<BuildStatus, BuildError> {
        info!(dir = %package_dir.display(), "Starting build");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(package_dir)
            .kill_on_drop(true);

        // Dropping the future on timeout kills the child.
        let status = timeout(self.build_timeout, command.status())
            .await
            .map_err(|_| BuildError::Timeout(self.build_timeout.as_secs()))?
            .map_err(|source| BuildError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        debug!(status = %status, "Build finished");
        Ok(BuildStatus::from_code(status.code()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_successful_build() {
        let temp = TempDir::new().unwrap();
        let builder = CommandBuilder::new("sh", vec!["-c".into(), "touch package.potato".into()]);

        let status = builder.build(temp.path()).await.unwrap();

        assert!(status.is_success());
        assert!(temp.path().join("package.potato").exists());
    }

    #[tokio::test]
    async fn test_failing_build_reports_code() {
        let temp = TempDir::new().unwrap();
        let builder = CommandBuilder::new("sh", vec!["-c".into(), "exit 3".into()]);

        let status = builder.build(temp.path()).await.unwrap();

        assert!(!status.is_success());
        assert_eq!(status.code, Some(3));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let temp = TempDir::new().unwrap();
        let builder = CommandBuilder::new("definitely-not-a-build-tool-xyz", vec![]);

        let result = builder.build(temp.path()).await;
        assert!(matches!(result, Err(BuildError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_build_timeout() {
        let temp = TempDir::new().unwrap();
        let builder = CommandBuilder::new("sleep", vec!["5".into()])
            .with_timeout(Duration::from_millis(50));

        let result = builder.build(temp.path()).await;
        assert!(matches!(result, Err(BuildError::Timeout(_))));
    }
}
