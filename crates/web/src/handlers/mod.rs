use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRef, FromRequest, Request, State},
    routing::{get, post},
};
use deployer_core::{
    AppError,
    config::Config,
    models::{DeployRequest, FromPayload, RepeatRequest},
};
use deployer_github::{GitHub, WorkflowDispatcher};
use serde_json::Value;
use tracing::Instrument;

use crate::{AppState, Service};

pub fn build_router(service: Service) -> Router<AppState> {
    let deploy_route = match service {
        Service::Deployer => post(deploy),
        Service::Repeater => post(repeat),
    };
    Router::new().route("/", get(health)).route("/v1/deploy", deploy_route)
}

/// JSON body validated into a typed request. Any failure is a 400.
pub struct Payload<T>(pub T);

impl<S, T> FromRequest<S> for Payload<T>
where
    T: FromPayload,
    Arc<Config>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<Value>::from_request(req, state)
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;
        let config = <Arc<Config>>::from_ref(state);
        T::from_payload(value, &config)
            .map(Payload)
            .map_err(|e| AppError::BadRequest(e.to_string()))
    }
}

async fn health() {}

async fn deploy(
    State(dispatcher): State<Arc<WorkflowDispatcher<GitHub>>>,
    Payload(request): Payload<DeployRequest>,
) -> Result<(), AppError> {
    let span = tracing::info_span!(
        "deploy",
        repository = %request.repository,
        workflow = %request.workflow,
        user = %request.user,
        platform = %request.platform,
    );
    run_deploy(&dispatcher, &request).instrument(span).await
}

async fn repeat(
    State(dispatcher): State<Arc<WorkflowDispatcher<GitHub>>>,
    Payload(request): Payload<RepeatRequest>,
) -> Result<(), AppError> {
    let span = tracing::info_span!(
        "repeat",
        repository = %request.deploy.repository,
        workflow = %request.deploy.workflow,
        user = %request.deploy.user,
        verb = %request.verb,
        endpoint = %request.endpoint,
    );
    run_deploy(&dispatcher, &request.deploy).instrument(span).await
}

async fn run_deploy(
    dispatcher: &WorkflowDispatcher<GitHub>,
    request: &DeployRequest,
) -> Result<(), AppError> {
    let completed = dispatcher.deploy(request).await?;
    let url = completed.html_url.as_deref().unwrap_or("-");
    if completed.conclusion.is_success() {
        tracing::info!(
            "Deploy requested by {} in {} succeeded: run #{} {}",
            request.user,
            request.channel,
            completed.run_number,
            url
        );
    } else {
        // Still a completed deploy call, the caller reads the conclusion from GitHub
        tracing::warn!(
            "Deploy requested by {} in {} finished with {}: run #{} {}",
            request.user,
            request.channel,
            completed.conclusion,
            completed.run_number,
            url
        );
    }
    Ok(())
}
