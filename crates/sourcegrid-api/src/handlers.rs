//! REST API handlers for connector management.
//!
//! Each handler calls one orchestrator operation and wraps the result in
//! the `{ success, data, error }` envelope.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use sourcegrid_orchestrator::{OrchestratorError, UpdateOptions};
use sourcegrid_state::{
    ConnectorDefinition, DefinitionId, DeliveryGuarantee, Implementation, ResourceLimits,
};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// HTTP status for each orchestrator error.
pub fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::AlreadyExists(_)
        | OrchestratorError::VersionConflict { .. }
        | OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
        OrchestratorError::InvalidConfig(_) | OrchestratorError::InvalidUpdate(_) => {
            StatusCode::BAD_REQUEST
        }
        OrchestratorError::NoCapacity(_) | OrchestratorError::Unreachable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        OrchestratorError::PartialFailure(_) | OrchestratorError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn api_error(err: OrchestratorError) -> Response {
    let status = status_for(&err);
    debug!(%status, error = %err, "request failed");
    match err {
        // Per-instance outcomes go back to the caller.
        OrchestratorError::PartialFailure(outcomes) => {
            let message = OrchestratorError::PartialFailure(outcomes.clone()).to_string();
            (
                status,
                Json(ApiResponse {
                    success: false,
                    data: Some(outcomes),
                    error: Some(message),
                }),
            )
                .into_response()
        }
        other => error_response(&other.to_string(), status),
    }
}

fn respond<T: Serialize>(result: Result<T, OrchestratorError>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => api_error(e),
    }
}

// ── Request bodies ─────────────────────────────────────────────

fn default_parallelism() -> u32 {
    1
}

/// Connector configuration as submitted by operators. The identity comes
/// from the path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub archive: Option<String>,
    pub topic: String,
    #[serde(default)]
    pub serde_class_name: Option<String>,
    #[serde(default)]
    pub schema_type: Option<String>,
    #[serde(default)]
    pub configs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub secrets: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    #[serde(default)]
    pub resources: Option<ResourceLimits>,
    #[serde(default)]
    pub processing_guarantees: DeliveryGuarantee,
    #[serde(default)]
    pub runtime_flags: Option<String>,
}

impl SourceConfig {
    pub fn into_definition(self, id: DefinitionId) -> ConnectorDefinition {
        ConnectorDefinition {
            id,
            implementation: Implementation {
                class_name: self.class_name,
                archive: self.archive,
            },
            topic: self.topic,
            serde_class_name: self.serde_class_name,
            schema_type: self.schema_type,
            configs: self.configs,
            secrets: self.secrets,
            parallelism: self.parallelism,
            resources: self.resources.unwrap_or_else(ResourceLimits::instance_default),
            processing_guarantees: self.processing_guarantees,
            runtime_flags: self.runtime_flags,
            version: 0,
            created_at: 0,
            updated_at: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(flatten)]
    pub config: SourceConfig,
    /// Package to run instead of `archive`.
    #[serde(default)]
    pub package_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    #[serde(flatten)]
    pub config: SourceConfig,
    #[serde(default)]
    pub package_url: Option<String>,
    #[serde(default)]
    pub expected_version: Option<u64>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub force_restart: bool,
}

type SourcePath = Path<(String, String, String)>;
type InstancePath = Path<(String, String, String, u32)>;

// ── Sources ────────────────────────────────────────────────────

/// GET /admin/v3/sources/{tenant}/{namespace}
pub async fn list_sources(
    State(state): State<ApiState>,
    Path((tenant, namespace)): Path<(String, String)>,
) -> Response {
    respond(state.orchestrator.list(&tenant, &namespace))
}

/// GET /admin/v3/sources/builtinsources
pub async fn list_builtin_sources(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.orchestrator.list_connector_types()).into_response()
}

/// POST /admin/v3/sources/{tenant}/{namespace}/{name}
pub async fn register_source(
    State(state): State<ApiState>,
    Path((tenant, namespace, name)): SourcePath,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return api_error(OrchestratorError::InvalidConfig(rejection.body_text())),
    };
    let id = DefinitionId::new(&tenant, &namespace, &name);
    let def = body.config.into_definition(id.clone());
    match state
        .orchestrator
        .register(&id, def, body.package_url.as_deref())
        .await
        .and_then(|()| state.orchestrator.get_info(&id))
    {
        Ok(stored) => (StatusCode::CREATED, ApiResponse::ok(stored)).into_response(),
        Err(e) => api_error(e),
    }
}

/// PUT /admin/v3/sources/{tenant}/{namespace}/{name}
pub async fn update_source(
    State(state): State<ApiState>,
    Path((tenant, namespace, name)): SourcePath,
    body: Result<Json<UpdateRequest>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return api_error(OrchestratorError::InvalidUpdate(rejection.body_text())),
    };
    let id = DefinitionId::new(&tenant, &namespace, &name);
    let options = UpdateOptions {
        expected_version: body.expected_version,
        batch_size: body.batch_size,
        force_restart: body.force_restart,
        package_ref: body.package_url,
    };
    let def = body.config.into_definition(id.clone());
    respond(state.orchestrator.update(&id, def, options).await)
}

/// DELETE /admin/v3/sources/{tenant}/{namespace}/{name}
pub async fn deregister_source(
    State(state): State<ApiState>,
    Path((tenant, namespace, name)): SourcePath,
) -> Response {
    let id = DefinitionId::new(&tenant, &namespace, &name);
    respond(state.orchestrator.deregister(&id).await)
}

/// GET /admin/v3/sources/{tenant}/{namespace}/{name}
pub async fn get_source(
    State(state): State<ApiState>,
    Path((tenant, namespace, name)): SourcePath,
) -> Response {
    respond(state.orchestrator.get_info(&DefinitionId::new(&tenant, &namespace, &name)))
}

/// GET /admin/v3/sources/{tenant}/{namespace}/{name}/status
pub async fn get_source_status(
    State(state): State<ApiState>,
    Path((tenant, namespace, name)): SourcePath,
) -> Response {
    let id = DefinitionId::new(&tenant, &namespace, &name);
    respond(state.orchestrator.get_status(&id).await)
}

/// GET /admin/v3/sources/{tenant}/{namespace}/{name}/{instance}/status
pub async fn get_instance_status(
    State(state): State<ApiState>,
    Path((tenant, namespace, name, instance)): InstancePath,
) -> Response {
    let id = DefinitionId::new(&tenant, &namespace, &name);
    respond(state.orchestrator.get_instance_status(&id, instance).await)
}

// ── Instance control ───────────────────────────────────────────

pub async fn start_all(State(state): State<ApiState>, Path((t, ns, name)): SourcePath) -> Response {
    respond(state.orchestrator.start_all(&DefinitionId::new(&t, &ns, &name)).await)
}

pub async fn stop_all(State(state): State<ApiState>, Path((t, ns, name)): SourcePath) -> Response {
    respond(state.orchestrator.stop_all(&DefinitionId::new(&t, &ns, &name)).await)
}

pub async fn restart_all(State(state): State<ApiState>, Path((t, ns, name)): SourcePath) -> Response {
    respond(state.orchestrator.restart_all(&DefinitionId::new(&t, &ns, &name)).await)
}

pub async fn start_instance(
    State(state): State<ApiState>,
    Path((t, ns, name, instance)): InstancePath,
) -> Response {
    let id = DefinitionId::new(&t, &ns, &name);
    respond(state.orchestrator.start_instance(&id, instance).await)
}

pub async fn stop_instance(
    State(state): State<ApiState>,
    Path((t, ns, name, instance)): InstancePath,
) -> Response {
    let id = DefinitionId::new(&t, &ns, &name);
    respond(state.orchestrator.stop_instance(&id, instance).await)
}

pub async fn restart_instance(
    State(state): State<ApiState>,
    Path((t, ns, name, instance)): InstancePath,
) -> Response {
    let id = DefinitionId::new(&t, &ns, &name);
    respond(state.orchestrator.restart_instance(&id, instance).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_mapping() {
        let cases = [
            (OrchestratorError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (OrchestratorError::AlreadyExists("x".into()), StatusCode::CONFLICT),
            (
                OrchestratorError::VersionConflict { expected: 1, actual: 2 },
                StatusCode::CONFLICT,
            ),
            (OrchestratorError::InvalidConfig("x".into()), StatusCode::BAD_REQUEST),
            (OrchestratorError::InvalidUpdate("x".into()), StatusCode::BAD_REQUEST),
            (OrchestratorError::NoCapacity("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (OrchestratorError::Unreachable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (OrchestratorError::PartialFailure(Vec::new()), StatusCode::INTERNAL_SERVER_ERROR),
            (OrchestratorError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{err}");
        }
    }

    #[test]
    fn source_config_defaults() {
        let config: SourceConfig = serde_json::from_value(serde_json::json!({
            "class_name": "org.example.Source",
            "topic": "persistent://t1/ns1/out"
        }))
        .unwrap();
        let def = config.into_definition(DefinitionId::new("t1", "ns1", "src1"));
        assert_eq!(def.parallelism, 1);
        assert_eq!(def.resources, ResourceLimits::instance_default());
        assert_eq!(def.processing_guarantees, DeliveryGuarantee::AtLeastOnce);
    }

    #[test]
    fn unknown_guarantee_rejected() {
        let parsed: Result<SourceConfig, _> = serde_json::from_value(serde_json::json!({
            "topic": "out",
            "processing_guarantees": "EXACTLY_TWICE"
        }));
        assert!(parsed.is_err());
    }
}
