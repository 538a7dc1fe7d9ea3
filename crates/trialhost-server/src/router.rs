//! HTTP router configuration.
//!
//! This module provides functions to build the Axum router with all
//! necessary routes and middleware.

use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handler::{
    check_subdomain, deprovision, get_provision, health_check, list_provisions, readiness_check,
    submit_provision,
};
use crate::state::AppState;

/// Build the application router.
///
/// Routes:
/// - `GET /health` - Health check
/// - `GET /ready` - Readiness check
/// - `GET /api/subdomains/:subdomain` - Subdomain availability
/// - `POST /api/provisions` - Submit a provisioning job (token)
/// - `GET /api/provisions` - List jobs
/// - `GET /api/provisions/:id` - Job status
/// - `POST /api/deprovisions` - Tear down a trial (token)
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check));

    let api_routes = Router::new()
        .route("/subdomains/:subdomain", get(check_subdomain))
        .route("/provisions", post(submit_provision).get(list_provisions))
        .route("/provisions/:id", get(get_provision))
        .route("/deprovisions", post(deprovision));

    Router::new()
        .merge(health_routes)
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::util::ServiceExt;

    use trialhost_common::{PoolConfig, ProvisionerConfig, ReadinessConfig};
    use trialhost_core::{Provisioner, SimulatedCloud};

    use super::*;

    fn setup(token: Option<&str>) -> (Arc<SimulatedCloud>, Router) {
        let config = ProvisionerConfig {
            readiness: ReadinessConfig {
                timeout_secs: 10,
                interval_secs: 1,
                attempt_timeout_secs: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let cloud = Arc::new(SimulatedCloud::new().with_template(8011));
        let backends = cloud.backends(PoolConfig {
            start: 9000,
            end: 9009,
        });
        let state = AppState::new(
            Provisioner::new(config, backends),
            token.map(str::to_string),
        );
        (cloud, build_router(state, Duration::from_secs(30)))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("X-Api-Token", token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn provision_body(subdomain: &str) -> Value {
        json!({
            "customer_email": "user@example.com",
            "oss_type": "nginx",
            "subdomain": subdomain,
            "duration_days": 7
        })
    }

    async fn wait_for_job(app: &Router, id: &str) -> Value {
        for _ in 0..500 {
            let response = app
                .clone()
                .oneshot(get_request(&format!("/api/provisions/{id}")))
                .await
                .unwrap();
            let job = json_body(response).await;
            if job["status"] != "running" {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_, app) = setup(None);

        let response = app.oneshot(get_request("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_check() {
        let (_, app) = setup(None);

        let response = app.oneshot(get_request("/ready")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["domain"], "persys.jp");
        assert_eq!(body["running_jobs"], 0);
    }

    #[tokio::test]
    async fn test_provision_then_deprovision() {
        let (cloud, app) = setup(None);

        let response = app
            .clone()
            .oneshot(post_json("/api/provisions", &provision_body("demo"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let id = json_body(response).await["id"].as_str().unwrap().to_string();

        let job = wait_for_job(&app, &id).await;
        assert_eq!(job["status"], "succeeded");
        assert_eq!(job["stage"], "Succeeded");
        assert_eq!(job["result"]["public_url"], "https://demo.persys.jp");
        assert_eq!(job["result"]["identifier"], 9000);

        let response = app
            .clone()
            .oneshot(get_request("/api/subdomains/demo"))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["available"], false);

        let deprovision = json!({
            "identifier": 9000,
            "tunnel_id": job["result"]["tunnel_id"],
            "subdomain": "demo"
        });
        let response = app
            .clone()
            .oneshot(post_json("/api/deprovisions", &deprovision, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = json_body(response).await;
        assert_eq!(report["warnings"], json!([]));
        assert!(cloud.is_empty());
    }

    #[tokio::test]
    async fn test_list_provisions() {
        let (_, app) = setup(None);
        app.clone()
            .oneshot(post_json("/api/provisions", &provision_body("one"), None))
            .await
            .unwrap();

        let response = app.oneshot(get_request("/api/provisions")).await.unwrap();

        let body = json_body(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["jobs"][0]["subdomain"], "one");
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_synchronously() {
        let (cloud, app) = setup(None);

        let response = app
            .oneshot(post_json(
                "/api/provisions",
                &provision_body("much-too-long-name"),
                None,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["kind"], "InvalidRequest");
        assert!(cloud.journal().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_app_rejected() {
        let (_, app) = setup(None);
        let mut body = provision_body("demo");
        body["oss_type"] = json!("wordpress");

        let response = app
            .oneshot(post_json("/api/provisions", &body, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["kind"], "UnknownApp");
    }

    #[tokio::test]
    async fn test_token_required_when_configured() {
        let (cloud, app) = setup(Some("secret"));

        let response = app
            .clone()
            .oneshot(post_json("/api/provisions", &provision_body("demo"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/provisions",
                &provision_body("demo"),
                Some("wrong"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(cloud.journal().is_empty());

        let response = app
            .oneshot(post_json(
                "/api/provisions",
                &provision_body("demo"),
                Some("secret"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_submit_rejected_during_shutdown() {
        let cloud = Arc::new(SimulatedCloud::new().with_template(8011));
        let state = AppState::new(
            Provisioner::new(
                ProvisionerConfig::default(),
                cloud.backends(PoolConfig::default()),
            ),
            None,
        );
        state.shutdown().await;
        let app = build_router(state, Duration::from_secs(30));

        let response = app
            .oneshot(post_json("/api/provisions", &provision_body("demo"), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(cloud.journal().is_empty());
    }

    #[tokio::test]
    async fn test_job_not_found() {
        let (_, app) = setup(None);

        let response = app
            .oneshot(get_request(
                "/api/provisions/00000000-0000-0000-0000-000000000000",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_subdomain_check_invalid() {
        let (_, app) = setup(None);

        let response = app
            .oneshot(get_request("/api/subdomains/-bad-"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
