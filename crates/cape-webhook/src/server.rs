//! HTTPS server for the admission webhook

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::error::WebhookError;
use crate::machine::{validate_handler, WebhookState, MACHINE_VALIDATE_PATH};

/// Where and with which certificate the webhook is served
#[derive(Clone, Debug)]
pub struct WebhookServerConfig {
    /// Listen address
    pub addr: SocketAddr,
    /// Directory holding `tls.crt` and `tls.key`
    pub cert_dir: PathBuf,
}

/// Create the webhook router
///
/// Routes:
/// - `POST /validate-cluster-x-k8s-io-v1beta1-machine` - Machine deletion guard
/// - `GET /healthz` - liveness
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MACHINE_VALIDATE_PATH, post(validate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the webhook over TLS until the server fails
pub async fn serve(state: Arc<WebhookState>, config: WebhookServerConfig) -> Result<(), WebhookError> {
    let cert = config.cert_dir.join("tls.crt");
    let key = config.cert_dir.join("tls.key");
    let tls_config = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .map_err(|e| WebhookError::Tls(format!("loading {}: {e}", cert.display())))?;

    info!(addr = %config.addr, "Starting admission webhook server");

    axum_server::bind_rustls(config.addr, tls_config)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MockClusterLookup;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> Arc<WebhookState> {
        Arc::new(WebhookState {
            clusters: Arc::new(MockClusterLookup::new()),
        })
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();

        let response = webhook_router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_certificates_fail_before_binding() {
        let config = WebhookServerConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            cert_dir: PathBuf::from("/nonexistent/serving-certs"),
        };

        let err = serve(state(), config).await.unwrap_err();
        assert!(matches!(err, WebhookError::Tls(_)));
        assert!(err.to_string().contains("tls.crt"));
    }
}
