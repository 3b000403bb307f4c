use anyhow::Result;
use deployer_core::{
    config::DispatchConfig,
    models::{DeployRequest, RepositoryName},
};
use octocrab::models::RunId;
use tokio::time::sleep;

use crate::runs::{Conclusion, WorkflowRun};

/// The three GitHub Actions calls a deploy is built from.
pub trait WorkflowApi {
    /// Most recent run of `workflow`, or `None` if it has never run.
    fn latest_run(
        &self,
        repository: &RepositoryName,
        workflow: &str,
    ) -> impl Future<Output = Result<Option<WorkflowRun>>> + Send;

    /// Trigger a `workflow_dispatch` event. GitHub does not return the new run.
    fn dispatch(
        &self,
        repository: &RepositoryName,
        workflow: &str,
        git_ref: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_run(
        &self,
        repository: &RepositoryName,
        run_id: RunId,
    ) -> impl Future<Output = Result<WorkflowRun>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Failed to dispatch workflow {workflow} on {repository} at {git_ref}")]
    Dispatch {
        repository: RepositoryName,
        workflow: String,
        git_ref: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Dispatched run of {workflow} on {repository} did not appear after {attempts} attempts")]
    RunNotFound { repository: RepositoryName, workflow: String, attempts: u32 },
    #[error("Workflow run {run_id} is still running")]
    RunInProgress { run_id: RunId },
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

/// A dispatched run that reached a conclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
    pub run_id: RunId,
    pub run_number: u64,
    pub conclusion: Conclusion,
    pub html_url: Option<String>,
}

/// Dispatches workflows and follows the resulting run until it concludes.
pub struct WorkflowDispatcher<A> {
    api: A,
    config: DispatchConfig,
}

impl<A: WorkflowApi> WorkflowDispatcher<A> {
    pub fn new(api: A, config: DispatchConfig) -> Self { Self { api, config } }

    #[cfg(test)]
    fn api(&self) -> &A { &self.api }

    pub async fn latest_run(
        &self,
        repository: &RepositoryName,
        workflow: &str,
    ) -> Result<Option<WorkflowRun>, DeployError> {
        Ok(self.api.latest_run(repository, workflow).await?)
    }

    pub async fn dispatch(
        &self,
        repository: &RepositoryName,
        workflow: &str,
        git_ref: &str,
    ) -> Result<(), DeployError> {
        self.api.dispatch(repository, workflow, git_ref).await.map_err(|source| {
            DeployError::Dispatch {
                repository: repository.clone(),
                workflow: workflow.to_string(),
                git_ref: git_ref.to_string(),
                source: source.into(),
            }
        })
    }

    /// Dispatch the requested workflow, wait for the new run to show up and
    /// return its conclusion.
    ///
    /// The new run is recognised by a run number strictly greater than the
    /// latest run seen before dispatching.
    pub async fn deploy(&self, request: &DeployRequest) -> Result<CompletedRun, DeployError> {
        let repository = &request.repository;
        let workflow = request.workflow.as_str();

        let baseline =
            self.latest_run(repository, workflow).await?.map_or(0, |run| run.run_number);
        tracing::info!("Latest run of {} on {} is #{}", workflow, repository, baseline);

        self.dispatch(repository, workflow, &request.git_ref).await?;
        tracing::info!("Dispatched {} on {} at {}", workflow, repository, request.git_ref);

        let run = self.wait_for_new_run(repository, workflow, baseline).await?;
        tracing::info!(
            "Found run #{} ({}) of {} on {}",
            run.run_number,
            run.id,
            workflow,
            repository
        );

        let conclusion = self.poll_for_conclusion(repository, run.id).await?;
        tracing::info!("Run {} of {} on {} concluded: {}", run.id, workflow, repository, conclusion);
        Ok(CompletedRun {
            run_id: run.id,
            run_number: run.run_number,
            conclusion,
            html_url: run.html_url,
        })
    }

    async fn wait_for_new_run(
        &self,
        repository: &RepositoryName,
        workflow: &str,
        baseline: u64,
    ) -> Result<WorkflowRun, DeployError> {
        let attempts = self.config.max_poll_attempts;
        for attempt in 1..=attempts {
            if let Some(run) = self.latest_run(repository, workflow).await?
                && run.run_number > baseline
            {
                return Ok(run);
            }
            tracing::debug!(
                "No run of {} on {} newer than #{} (attempt {}/{})",
                workflow,
                repository,
                baseline,
                attempt,
                attempts
            );
            sleep(self.config.poll_interval()).await;
        }
        tracing::warn!(
            "Dispatched run of {} on {} did not appear after {} attempts",
            workflow,
            repository,
            attempts
        );
        Err(DeployError::RunNotFound {
            repository: repository.clone(),
            workflow: workflow.to_string(),
            attempts,
        })
    }

    /// Check the run's conclusion, failing with [`DeployError::RunInProgress`]
    /// once `conclusion_attempts` checks found it unfinished.
    pub async fn poll_for_conclusion(
        &self,
        repository: &RepositoryName,
        run_id: RunId,
    ) -> Result<Conclusion, DeployError> {
        let attempts = self.config.conclusion_attempts.max(1);
        let mut attempt = 1;
        loop {
            let run = self.api.get_run(repository, run_id).await?;
            if let Some(conclusion) = run.conclusion {
                return Ok(conclusion);
            }
            if attempt >= attempts {
                return Err(DeployError::RunInProgress { run_id });
            }
            tracing::debug!(
                "Run {} is {} (attempt {}/{})",
                run_id,
                run.status.as_deref().unwrap_or("in progress"),
                attempt,
                attempts
            );
            attempt += 1;
            sleep(self.config.poll_interval()).await;
        }
    }
}
