pub mod dispatch;
pub mod runs;

use anyhow::{Context, Result};
use deployer_core::{config::GitHubConfig, models::RepositoryName};
use http::header::{ACCEPT, HeaderName};
use octocrab::{Octocrab, models::RunId, service::middleware::retry::RetryConfig};

pub use crate::{
    dispatch::{CompletedRun, DeployError, WorkflowApi, WorkflowDispatcher},
    runs::{Conclusion, WorkflowRun, WorkflowRunList},
};

const GITHUB_MEDIA_TYPE: &str = "application/vnd.github+json";
const GITHUB_API_VERSION: &str = "2022-11-28";

#[derive(Clone)]
pub struct GitHub {
    pub client: Octocrab,
}

#[derive(serde::Serialize)]
struct PageParams {
    per_page: u8,
}

impl GitHub {
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        let timeout = config.timeout();
        let client = Octocrab::builder()
            .base_uri(config.api_url.as_str())
            .with_context(|| format!("Invalid GitHub API URL {}", config.api_url))?
            .personal_token(config.token.clone())
            .add_header(ACCEPT, GITHUB_MEDIA_TYPE.to_string())
            .add_header(
                HeaderName::from_static("x-github-api-version"),
                GITHUB_API_VERSION.to_string(),
            )
            // Failed calls abort the deploy, they are never retried
            .add_retry_config(RetryConfig::None)
            .set_connect_timeout(Some(timeout))
            .set_read_timeout(Some(timeout))
            .set_write_timeout(Some(timeout))
            .build()
            .context("Failed to create GitHub client")?;
        Ok(Self { client })
    }

    /// Log the account the token belongs to.
    pub async fn check_login(&self) -> Result<()> {
        let profile = self.client.current().user().await.context("Failed to fetch current user")?;
        tracing::info!("Logged in as {}", profile.login);
        Ok(())
    }
}

impl WorkflowApi for GitHub {
    async fn latest_run(
        &self,
        repository: &RepositoryName,
        workflow: &str,
    ) -> Result<Option<WorkflowRun>> {
        let RepositoryName { owner, name } = repository;
        let response: WorkflowRunList = self
            .client
            .get(
                format!("/repos/{owner}/{name}/actions/workflows/{workflow}/runs"),
                Some(&PageParams { per_page: 1 }),
            )
            .await
            .with_context(|| format!("Failed to fetch latest run of {workflow} on {repository}"))?;
        Ok(response.workflow_runs.into_iter().next())
    }

    async fn dispatch(
        &self,
        repository: &RepositoryName,
        workflow: &str,
        git_ref: &str,
    ) -> Result<()> {
        self.client
            .actions()
            .create_workflow_dispatch(&repository.owner, &repository.name, workflow, git_ref)
            // octocrab serializes absent inputs as `null`, GitHub expects an object
            .inputs(serde_json::json!({}))
            .send()
            .await
            .with_context(|| format!("Failed to dispatch {workflow} on {repository}"))?;
        Ok(())
    }

    async fn get_run(&self, repository: &RepositoryName, run_id: RunId) -> Result<WorkflowRun> {
        let RepositoryName { owner, name } = repository;
        self.client
            .get(format!("/repos/{owner}/{name}/actions/runs/{run_id}"), None::<&()>)
            .await
            .with_context(|| format!("Failed to fetch workflow run {run_id} on {repository}"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use deployer_core::{config::DispatchConfig, models::DeployRequest};
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path, query_param},
    };

    use super::*;

    const RUNS_PATH: &str = "/repos/acme/widgets/actions/workflows/deploy.yml/runs";
    const DISPATCH_PATH: &str = "/repos/acme/widgets/actions/workflows/deploy.yml/dispatches";

    fn github(server: &MockServer) -> GitHub { github_with_timeout(server, 5) }

    fn github_with_timeout(server: &MockServer, timeout_secs: u64) -> GitHub {
        GitHub::new(&GitHubConfig {
            token: "test-token".to_string(),
            api_url: server.uri(),
            timeout_secs,
        })
        .unwrap()
    }

    fn deploy_request() -> DeployRequest {
        serde_json::from_value(json!({
            "platform": "slack",
            "channel": "C123",
            "thread_ts": "1700000000.000100",
            "user": "U42",
            "repository": "acme/widgets",
            "workflow": "deploy.yml",
            "ref": "main",
            "completion_message": "Deployed!",
            "artifacts_to_read": [],
        }))
        .unwrap()
    }

    fn repository() -> RepositoryName { "acme/widgets".parse().unwrap() }

    fn run_list(runs: serde_json::Value) -> ResponseTemplate {
        let total_count = runs.as_array().map_or(0, |r| r.len());
        ResponseTemplate::new(200)
            .set_body_json(json!({ "total_count": total_count, "workflow_runs": runs }))
    }

    #[tokio::test]
    async fn test_latest_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RUNS_PATH))
            .and(query_param("per_page", "1"))
            .and(header("authorization", "Bearer test-token"))
            .and(header("x-github-api-version", GITHUB_API_VERSION))
            .respond_with(run_list(json!([
                { "id": 555, "run_number": 41, "status": "completed", "conclusion": "success" }
            ])))
            .expect(2)
            .mount(&server)
            .await;

        let github = github(&server);
        let first = github.latest_run(&repository(), "deploy.yml").await.unwrap().unwrap();
        assert_eq!(first.id, RunId(555));
        assert_eq!(first.run_number, 41);
        assert_eq!(first.conclusion, Some(Conclusion::Success));
        let second = github.latest_run(&repository(), "deploy.yml").await.unwrap().unwrap();
        assert_eq!(second.run_number, first.run_number);
    }

    #[tokio::test]
    async fn test_latest_run_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RUNS_PATH))
            .respond_with(run_list(json!([])))
            .mount(&server)
            .await;

        let github = github(&server);
        assert_eq!(github.latest_run(&repository(), "deploy.yml").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dispatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DISPATCH_PATH))
            .and(body_json(json!({ "ref": "release/1.2", "inputs": {} })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let github = github(&server);
        github.dispatch(&repository(), "deploy.yml", "release/1.2").await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DISPATCH_PATH))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "message": "No ref found for: nope",
                "documentation_url": "https://docs.github.com/rest",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let github = github(&server);
        let err = github.dispatch(&repository(), "deploy.yml", "nope").await.unwrap_err();
        assert!(
            err.to_string().starts_with("Failed to dispatch deploy.yml on acme/widgets"),
            "{err:#}"
        );
    }

    #[tokio::test]
    async fn test_dispatch_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RUNS_PATH))
            .respond_with(run_list(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(DISPATCH_PATH))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(4)))
            .mount(&server)
            .await;

        let github = github_with_timeout(&server, 1);
        assert!(github.dispatch(&repository(), "deploy.yml", "main").await.is_err());

        let dispatcher = WorkflowDispatcher::new(github, DispatchConfig::default());
        let err = dispatcher.deploy(&deploy_request()).await.unwrap_err();
        assert!(
            matches!(err, DeployError::Dispatch { ref workflow, .. } if workflow == "deploy.yml"),
            "{err:?}"
        );
        // Only the baseline read happened, the new run was never looked for
        let runs_reads = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method.as_str() == "GET")
            .count();
        assert_eq!(runs_reads, 1);
    }

    #[tokio::test]
    async fn test_get_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/actions/runs/777"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 777,
                "run_number": 3,
                "status": "in_progress",
                "conclusion": null,
            })))
            .mount(&server)
            .await;

        let github = github(&server);
        let run = github.get_run(&repository(), RunId(777)).await.unwrap();
        assert_eq!(run.run_number, 3);
        assert_eq!(run.conclusion, None);
    }

    #[tokio::test]
    async fn test_server_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/actions/runs/777"))
            .respond_with(ResponseTemplate::new(502).set_body_json(json!({
                "message": "Server Error",
                "documentation_url": "https://docs.github.com/rest",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let github = github(&server);
        assert!(github.get_run(&repository(), RunId(777)).await.is_err());
    }

    #[tokio::test]
    async fn test_deploy_against_github() {
        let server = MockServer::start().await;
        // Baseline read sees no runs; every later read sees the dispatched run
        Mock::given(method("GET"))
            .and(path(RUNS_PATH))
            .respond_with(run_list(json!([])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(RUNS_PATH))
            .respond_with(run_list(json!([
                { "id": 901, "run_number": 1, "status": "queued", "conclusion": null }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(DISPATCH_PATH))
            .and(body_json(json!({ "ref": "main", "inputs": {} })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/actions/runs/901"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 901,
                "run_number": 1,
                "status": "completed",
                "conclusion": "success",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = WorkflowDispatcher::new(github(&server), DispatchConfig::default());
        let completed = dispatcher.deploy(&deploy_request()).await.unwrap();
        assert_eq!(completed.run_id, RunId(901));
        assert_eq!(completed.run_number, 1);
        assert!(completed.conclusion.is_success());
    }
}
