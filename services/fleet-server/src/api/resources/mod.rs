//! Resource endpoints.

mod autoscaling;
mod init_scripts;
mod instance_builds;
mod instances;
mod sns;

use axum::{middleware, Router};

use crate::api::auth::{require_bootstrap, require_operator};
use crate::state::AppState;

pub use init_scripts::SHELL_SCRIPT_CONTENT_TYPE;
pub use instance_builds::MAX_BUILD_COUNT;

/// Operator routes, bootstrap routes and the unauthenticated topic intake,
/// each group behind its own gate.
pub fn routes(state: &AppState) -> Router<AppState> {
    let operator = Router::new()
        .merge(instance_builds::operator_routes())
        .merge(instances::routes())
        .merge(autoscaling::routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_operator,
        ));

    let bootstrap = Router::new()
        .merge(instance_builds::bootstrap_routes())
        .merge(init_scripts::routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bootstrap,
        ));

    Router::new()
        .merge(operator)
        .merge(bootstrap)
        .merge(sns::routes())
}
