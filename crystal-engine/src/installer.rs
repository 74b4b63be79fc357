use async_trait::async_trait;
use crystal_protocol::{FilterSpec, ResolvedTarget, StaticPolicyEntry};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Collaborator that installs filters into, and removes them from, a
/// target's object pipeline on the storage side.
#[async_trait]
pub trait FilterInstaller: Send + Sync + 'static {
    async fn install(
        &self,
        target: &ResolvedTarget,
        filter: &FilterSpec,
        policy: &StaticPolicyEntry,
    ) -> Result<(), InstallerError>;

    async fn uninstall(&self, target: &ResolvedTarget, filter: &FilterSpec) -> Result<(), InstallerError>;
}

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("filter `{0}` is unknown to the storage backend")]
    FilterNotFound(String),
    #[error("invalid filter service url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("filter request failed: {0}")]
    Http(String),
    #[error("filter service returned unexpected status {status}")]
    UnexpectedStatus { status: reqwest::StatusCode },
}

/// HTTP client for the filter management API of the storage backend.
///
/// `PUT {base}/filters/{target}/deploy/{filter}` installs a filter with the
/// policy data as body; `PUT {base}/filters/{target}/undeploy/{filter}`
/// removes it. The configured token travels in `X-Auth-Token`.
#[derive(Clone)]
pub struct HttpFilterInstaller {
    http: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeployRequest<'a> {
    filter: &'a FilterSpec,
    policy: &'a StaticPolicyEntry,
}

#[derive(Debug, Serialize)]
struct UndeployRequest<'a> {
    filter: &'a FilterSpec,
}

impl HttpFilterInstaller {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, InstallerError> {
        let mut url = Url::parse(base_url).map_err(|err| InstallerError::InvalidUrl {
            url: base_url.to_string(),
            source: err,
        })?;

        if !url.path().ends_with('/') {
            let mut path = url.path().trim_end_matches('/').to_string();
            path.push('/');
            url.set_path(&path);
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: url,
            auth_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, target: &ResolvedTarget, verb: &str, filter: &str) -> Result<Url, InstallerError> {
        let path = format!(
            "filters/{}/{}/{}",
            encode_path_segment(&target.target_id()),
            verb,
            encode_path_segment(filter)
        );
        self.base_url.join(&path).map_err(|err| InstallerError::InvalidUrl {
            url: format!("{}{}", self.base_url, path),
            source: err,
        })
    }

    async fn put<B: Serialize + ?Sized>(&self, url: Url, filter: &str, body: &B) -> Result<(), InstallerError> {
        let mut request = self.http.put(url).json(body);
        if let Some(token) = &self.auth_token {
            request = request.header("X-Auth-Token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| InstallerError::Http(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(InstallerError::FilterNotFound(filter.to_string()));
        }
        if !status.is_success() {
            return Err(InstallerError::UnexpectedStatus { status });
        }
        Ok(())
    }
}

fn encode_path_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

#[async_trait]
impl FilterInstaller for HttpFilterInstaller {
    async fn install(
        &self,
        target: &ResolvedTarget,
        filter: &FilterSpec,
        policy: &StaticPolicyEntry,
    ) -> Result<(), InstallerError> {
        let url = self.endpoint(target, "deploy", &filter.name)?;
        debug!(%url, policy_id = policy.policy_id, "installing filter");
        self.put(url, &filter.name, &DeployRequest { filter, policy }).await
    }

    async fn uninstall(&self, target: &ResolvedTarget, filter: &FilterSpec) -> Result<(), InstallerError> {
        let url = self.endpoint(target, "undeploy", &filter.name)?;
        debug!(%url, "uninstalling filter");
        self.put(url, &filter.name, &UndeployRequest { filter }).await
    }
}

/// Installer used when no filter service is configured: logs and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunInstaller;

#[async_trait]
impl FilterInstaller for DryRunInstaller {
    async fn install(
        &self,
        target: &ResolvedTarget,
        filter: &FilterSpec,
        policy: &StaticPolicyEntry,
    ) -> Result<(), InstallerError> {
        info!(target_id = %target, filter = %filter.name, policy_id = policy.policy_id, "dry-run install");
        Ok(())
    }

    async fn uninstall(&self, target: &ResolvedTarget, filter: &FilterSpec) -> Result<(), InstallerError> {
        info!(target_id = %target, filter = %filter.name, "dry-run uninstall");
        Ok(())
    }
}
