#![forbid(unsafe_code)]

use std::net::SocketAddr;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use expenses_adapter::{
    init_tracing, AdapterConfig, AdapterError, AdapterHealthResponse, AdapterRuntime,
    GetUserAdapterRequest, MultipartFieldSource, HTTP_BODY_LIMIT_BYTES,
};
use expenses_contracts::auth::{NewAccount, SubjectId};

const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Clone, Copy)]
struct AuthorizedSubject(SubjectId);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = match AdapterConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(
                error = %err,
                kind = err.failure_kind().as_str(),
                reason_code = err.reason_code().0,
                "startup aborted"
            );
            return Err(err.into());
        }
    };
    let addr: SocketAddr = config.http_bind.parse()?;
    let runtime = AdapterRuntime::from_config(&config).await?;

    tracing::info!(%addr, "expenses_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(runtime))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn app(runtime: AdapterRuntime) -> Router {
    let upload = Router::new()
        .route("/create-expense", post(create_expense))
        .route_layer(middleware::from_fn_with_state(
            runtime.clone(),
            require_bearer,
        ))
        .layer(DefaultBodyLimit::max(HTTP_BODY_LIMIT_BYTES));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/create-user", post(create_user))
        .route("/get-user", get(get_user))
        .merge(upload)
        .with_state(runtime)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn error_response(err: &AdapterError) -> Response {
    (err.http_status(), Json(err.to_response())).into_response()
}

/// Rejects before the body is touched when the bearer is missing, unknown or expired.
async fn require_bearer(
    State(runtime): State<AdapterRuntime>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    match runtime.authorize_bearer(header.as_deref()).await {
        Ok(subject_id) => {
            request
                .extensions_mut()
                .insert(AuthorizedSubject(subject_id));
            next.run(request).await
        }
        Err(err) => {
            tracing::info!(outcome = err.outcome(), "upload rejected by bearer gate");
            error_response(&err)
        }
    }
}

async fn healthz(State(runtime): State<AdapterRuntime>) -> (StatusCode, Json<AdapterHealthResponse>) {
    (StatusCode::OK, Json(runtime.health_report()))
}

async fn create_user(
    State(runtime): State<AdapterRuntime>,
    Json(account): Json<NewAccount>,
) -> Response {
    match runtime.create_user(account).await {
        Ok(out) => (StatusCode::OK, Json(out)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn get_user(
    State(runtime): State<AdapterRuntime>,
    Json(request): Json<GetUserAdapterRequest>,
) -> Response {
    match runtime.get_user(request).await {
        Ok(out) => (StatusCode::OK, Json(out)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn create_expense(
    State(runtime): State<AdapterRuntime>,
    Extension(AuthorizedSubject(subject_id)): Extension<AuthorizedSubject>,
    mut multipart: Multipart,
) -> Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                return error_response(&AdapterError::InvalidRequest(format!(
                    "multipart field '{UPLOAD_FIELD}' is required"
                )))
            }
            Err(err) => return error_response(&AdapterError::InvalidRequest(err.body_text())),
        };
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        tracing::info!(
            subject_id = %subject_id,
            file_name = field.file_name().unwrap_or(""),
            "receipt upload started"
        );
        let mut source = MultipartFieldSource::new(field);
        return match runtime
            .create_expense_authorized(subject_id, &mut source)
            .await
        {
            Ok(out) => (StatusCode::OK, Json(out)).into_response(),
            Err(err) => error_response(&err),
        };
    }
}
