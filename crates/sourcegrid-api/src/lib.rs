//! sourcegrid-api: REST API for SourceGrid.
//!
//! Axum route handlers over the [`Orchestrator`] operations and worker
//! membership. Callers are assumed to be authenticated already.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/admin/v3/sources/{tenant}/{namespace}` | List connector names |
//! | POST | `/admin/v3/sources/{tenant}/{namespace}/{name}` | Register a connector |
//! | PUT | `/admin/v3/sources/{tenant}/{namespace}/{name}` | Update a connector |
//! | DELETE | `/admin/v3/sources/{tenant}/{namespace}/{name}` | Deregister a connector |
//! | GET | `/admin/v3/sources/{tenant}/{namespace}/{name}` | Connector definition |
//! | GET | `/admin/v3/sources/{tenant}/{namespace}/{name}/status` | Aggregated status |
//! | GET | `/admin/v3/sources/{tenant}/{namespace}/{name}/{instance}/status` | Instance status |
//! | POST | `/admin/v3/sources/{tenant}/{namespace}/{name}/{start,stop,restart}` | All instances |
//! | POST | `/admin/v3/sources/{tenant}/{namespace}/{name}/{instance}/{start,stop,restart}` | One instance |
//! | GET | `/admin/v3/sources/builtinsources` | Built-in source types |
//! | GET | `/admin/v3/workers` | List workers |
//! | POST | `/admin/v3/workers` | Join |
//! | DELETE | `/admin/v3/workers/{id}` | Leave |
//! | POST | `/admin/v3/workers/{id}/heartbeat` | Heartbeat |
//! | POST | `/admin/v3/workers/{id}/reports` | Instance status reports |

pub mod handlers;
pub mod worker_handlers;

use axum::Router;
use axum::routing::{get, post};
use sourcegrid_cluster::MembershipManager;
use sourcegrid_orchestrator::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub membership: MembershipManager,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let sources = Router::new()
        .route("/builtinsources", get(handlers::list_builtin_sources))
        .route("/{tenant}/{namespace}", get(handlers::list_sources))
        .route(
            "/{tenant}/{namespace}/{name}",
            get(handlers::get_source)
                .post(handlers::register_source)
                .put(handlers::update_source)
                .delete(handlers::deregister_source),
        )
        .route("/{tenant}/{namespace}/{name}/status", get(handlers::get_source_status))
        .route("/{tenant}/{namespace}/{name}/start", post(handlers::start_all))
        .route("/{tenant}/{namespace}/{name}/stop", post(handlers::stop_all))
        .route("/{tenant}/{namespace}/{name}/restart", post(handlers::restart_all))
        .route(
            "/{tenant}/{namespace}/{name}/{instance}/status",
            get(handlers::get_instance_status),
        )
        .route("/{tenant}/{namespace}/{name}/{instance}/start", post(handlers::start_instance))
        .route("/{tenant}/{namespace}/{name}/{instance}/stop", post(handlers::stop_instance))
        .route(
            "/{tenant}/{namespace}/{name}/{instance}/restart",
            post(handlers::restart_instance),
        );

    let workers = Router::new()
        .route("/", get(worker_handlers::list_workers).post(worker_handlers::join))
        .route("/{id}", axum::routing::delete(worker_handlers::leave))
        .route("/{id}/heartbeat", post(worker_handlers::heartbeat))
        .route("/{id}/reports", post(worker_handlers::reports));

    Router::new()
        .nest("/admin/v3/sources", sources)
        .nest("/admin/v3/workers", workers)
        .with_state(state)
}
