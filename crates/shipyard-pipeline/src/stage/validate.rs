//! Validate stage: permission checks and config resolution.

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::config::ValidationConfig;
use crate::error::{ProviderError, StageFailure};
use crate::types::{DeploymentConfig, DeploymentContext, Stage};

/// Capability deciding whether a deployment may proceed and where it goes.
///
/// Both calls are real boundary calls. An implementation that cannot reach
/// its backing service reports a network fault, which the orchestrator
/// retries; a refused permission is an auth fault and is final.
#[async_trait]
pub trait DeploymentValidator: Send + Sync {
    /// Check that the requester may deploy this project to this environment.
    async fn authorize(&self, context: &DeploymentContext) -> Result<(), ProviderError>;

    /// Resolve infrastructure parameters for the deployment.
    async fn resolve_config(
        &self,
        context: &DeploymentContext,
    ) -> Result<DeploymentConfig, ProviderError>;
}

/// Run the validate stage.
#[instrument(skip_all, fields(deployment_id = %context.deployment_id))]
pub async fn validate(
    validator: &dyn DeploymentValidator,
    context: &DeploymentContext,
) -> Result<DeploymentConfig, StageFailure> {
    validator
        .authorize(context)
        .await
        .map_err(|e| StageFailure::from_provider(Stage::Validate, &e))?;

    let config = validator
        .resolve_config(context)
        .await
        .map_err(|e| StageFailure::from_provider(Stage::Validate, &e))?;

    debug!(namespace = %config.namespace, endpoint = %config.endpoint, "deployment config resolved");
    Ok(config)
}

/// Validator driven entirely by configuration.
#[derive(Debug, Clone)]
pub struct StaticValidator {
    environments: Vec<String>,
    namespace_template: String,
    allowed_orgs: Vec<String>,
    base_domain: String,
}

impl StaticValidator {
    /// Create a validator from configuration.
    #[must_use]
    pub fn new(config: &ValidationConfig, base_domain: impl Into<String>) -> Self {
        Self {
            environments: config.environments.clone(),
            namespace_template: config.namespace_template.clone(),
            allowed_orgs: config.allowed_orgs.clone(),
            base_domain: base_domain.into(),
        }
    }

    fn environment_allowed(&self, environment: &str) -> bool {
        self.environments.iter().any(|pattern| {
            pattern
                .strip_suffix('*')
                .map_or(pattern == environment, |prefix| {
                    environment.len() > prefix.len() && environment.starts_with(prefix)
                })
        })
    }

    fn namespace(&self, context: &DeploymentContext) -> String {
        let raw = self
            .namespace_template
            .replace("{org}", context.org_id.as_str())
            .replace("{project}", context.project_id.as_str())
            .replace("{environment}", &context.environment);
        sanitise_label(&raw)
    }
}

#[async_trait]
impl DeploymentValidator for StaticValidator {
    async fn authorize(&self, context: &DeploymentContext) -> Result<(), ProviderError> {
        if context.project_id.as_str().is_empty() {
            return Err(ProviderError::rejected("project id is empty"));
        }
        if !self.allowed_orgs.is_empty()
            && !self.allowed_orgs.iter().any(|o| o == context.org_id.as_str())
        {
            return Err(ProviderError::auth(format!(
                "organization {} may not deploy",
                context.org_id
            )));
        }
        if !self.environment_allowed(&context.environment) {
            return Err(ProviderError::rejected(format!(
                "environment not allowed: {}",
                context.environment
            )));
        }
        Ok(())
    }

    async fn resolve_config(
        &self,
        context: &DeploymentContext,
    ) -> Result<DeploymentConfig, ProviderError> {
        let namespace = self.namespace(context);
        if namespace.is_empty() {
            return Err(ProviderError::rejected("namespace template resolved to nothing"));
        }
        Ok(DeploymentConfig {
            registry: format!("{namespace}/{}", sanitise_label(context.project_id.as_str())),
            endpoint: format!("https://{namespace}.{}", self.base_domain),
            storage_prefix: format!(
                "deployments/{}/{}",
                context.project_id, context.deployment_id
            ),
            namespace,
        })
    }
}

/// Lowercase a label and collapse anything outside `[a-z0-9]` into single dashes.
fn sanitise_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::error::{ErrorKind, FaultClass};
    use crate::types::{OrgId, ProjectId, SourceRef, UserId};

    fn context(org: &str, environment: &str) -> DeploymentContext {
        DeploymentContext::new(
            ProjectId::new("My_Site"),
            OrgId::new(org),
            UserId::new("u1"),
            environment,
            SourceRef::Upload {
                handle: "up-1".to_owned(),
                path: PathBuf::from("/tmp/up-1"),
            },
        )
    }

    fn validator() -> StaticValidator {
        StaticValidator::new(&ValidationConfig::default(), "shipyard.app")
    }

    #[tokio::test]
    async fn resolves_config_from_template() {
        let ctx = context("Acme", "production");
        let config = validate(&validator(), &ctx).await.unwrap();
        assert_eq!(config.namespace, "acme-my-site-production");
        assert_eq!(config.endpoint, "https://acme-my-site-production.shipyard.app");
        assert!(config.storage_prefix.ends_with(ctx.deployment_id.as_str()));
    }

    #[tokio::test]
    async fn preview_wildcard_matches_suffix_only() {
        let v = validator();
        assert!(v.authorize(&context("o1", "preview-42")).await.is_ok());
        assert!(v.authorize(&context("o1", "preview-")).await.is_err());
        assert!(v.authorize(&context("o1", "qa")).await.is_err());
    }

    #[tokio::test]
    async fn unknown_environment_is_final() {
        let failure = validate(&validator(), &context("o1", "qa")).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Validate);
        assert_eq!(failure.kind, ErrorKind::ValidationError);
        assert_eq!(failure.class, FaultClass::Rejected);
        assert!(!failure.is_retryable());
    }

    #[tokio::test]
    async fn org_allow_list_is_enforced() {
        let config = ValidationConfig {
            allowed_orgs: vec!["o1".to_owned()],
            ..ValidationConfig::default()
        };
        let v = StaticValidator::new(&config, "shipyard.app");
        assert!(v.authorize(&context("o1", "staging")).await.is_ok());

        let err = v.authorize(&context("o2", "staging")).await.unwrap_err();
        assert_eq!(err.class, FaultClass::Auth);
    }

    #[test]
    fn labels_are_sanitised() {
        assert_eq!(sanitise_label("Acme Corp__Site"), "acme-corp-site");
        assert_eq!(sanitise_label("--x--"), "x");
        assert_eq!(sanitise_label("!!!"), "");
    }
}
