/// HTTP Server logic
use crate::infer::{Infer, InferError};
use crate::prompt::{ChatTemplate, PromptNormalizer};
use crate::validation::Validation;
use crate::{
    ChatMessage, ErrorResponse, GenerateRequest, Info, ResponseEnvelope, TextInput,
};
use axum::extract::rejection::JsonRejection;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{body::StreamBody, Extension, Json, Router};
use futures::StreamExt;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_backend::{Engine, GenerationParameters};
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::instrument;
use utoipa::OpenApi;

/// Generate completions for one prompt or a batch of prompts
#[utoipa::path(
    post,
    tag = "Switchboard",
    path = "/",
    request_body = GenerateRequest,
    responses(
        (status = 200, description = "Generated Text", body = ResponseEnvelope),
        (status = 400, description = "Invalid Request", body = ErrorResponse),
        (status = 429, description = "Model is overloaded", body = ErrorResponse),
        (status = 500, description = "Generation Error", body = ErrorResponse),
    )
)]
#[instrument(skip_all)]
async fn generate(
    infer: Extension<Infer>,
    request: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(err) => {
            metrics::increment_counter!("switchboard_request_failure", "err" => "invalid_json");
            tracing::error!("{err}");
            let error = ErrorResponse {
                error: "Invalid JSON format from http request.".to_string(),
                error_type: "invalid_json".to_string(),
            };
            return (StatusCode::BAD_REQUEST, Json(error)).into_response();
        }
    };

    metrics::increment_counter!("switchboard_request_count");

    if request.stream {
        handle_streaming(infer, request).await
    } else {
        handle_non_streaming(infer, request).await
    }
}

async fn handle_non_streaming(infer: Extension<Infer>, request: GenerateRequest) -> Response {
    let start_time = Instant::now();

    match infer.generate(request).await {
        Ok(response) => {
            metrics::increment_counter!("switchboard_request_success");
            metrics::histogram!(
                "switchboard_request_duration",
                start_time.elapsed().as_secs_f64()
            );
            let generated: u64 = response
                .envelopes
                .iter()
                .map(|envelope| u64::from(envelope.num_generated_tokens))
                .sum();
            metrics::histogram!("switchboard_request_generated_tokens", generated as f64);

            tracing::info!("Success");

            if response.single_input {
                let [envelope]: [ResponseEnvelope; 1] = match response.envelopes.try_into() {
                    Ok(envelope) => envelope,
                    Err(_) => {
                        return error_response(InferError::IncompleteGeneration);
                    }
                };
                Json(envelope).into_response()
            } else {
                Json(response.envelopes).into_response()
            }
        }
        Err(err) => error_response(err),
    }
}

async fn handle_streaming(infer: Extension<Infer>, request: GenerateRequest) -> Response {
    let start_time = Instant::now();

    let (permit, mut envelopes) = match infer.generate_stream(request).await {
        Ok(stream) => stream,
        Err(err) => return error_response(err),
    };

    let stream = async_stream::stream! {
        // Keep the concurrency slot for as long as the body is being sent
        let _permit = permit;
        let mut generated_tokens: u64 = 0;

        while let Some(envelope) = envelopes.next().await {
            match envelope {
                Ok(envelope) => {
                    generated_tokens += u64::from(envelope.num_generated_tokens);
                    yield Ok::<String, Infallible>(envelope.generated_text);
                }
                Err(err) => {
                    // The status line is long gone; all we can do is log,
                    // count, and truncate the body
                    metrics::increment_counter!("switchboard_request_failure", "err" => err.error_type().to_string());
                    tracing::error!("{err}");
                    break;
                }
            }
        }

        metrics::histogram!("switchboard_request_generated_tokens", generated_tokens as f64);
        metrics::histogram!(
            "switchboard_request_duration",
            start_time.elapsed().as_secs_f64()
        );
        tracing::info!("Success");
    };

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        StreamBody::new(stream),
    )
        .into_response()
}

/// Router info
#[utoipa::path(
    get,
    tag = "Switchboard",
    path = "/info",
    responses((status = 200, description = "Served engine info", body = Info))
)]
#[instrument(skip_all)]
async fn get_info(info: Extension<Info>) -> Json<Info> {
    Json(info.0)
}

/// Health check method
#[utoipa::path(
    get,
    tag = "Switchboard",
    path = "/health",
    responses(
        (status = 200, description = "Everything is working fine"),
        (status = 500, description = "Engine is unhealthy", body = ErrorResponse),
    )
)]
#[instrument(skip_all)]
async fn health(infer: Extension<Infer>) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    // A free-running one token probe through the whole stack
    let request = GenerateRequest {
        text: TextInput::Single("Who?".to_string()),
        stream: false,
        config: GenerationParameters {
            max_new_tokens: Some(1),
            ..Default::default()
        },
    };

    match infer.generate(request).await {
        Ok(_) => Ok(()),
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: err.to_string(),
                error_type: err.error_type().to_string(),
            }),
        )),
    }
}

/// Prometheus metrics scrape endpoint
#[utoipa::path(
    get,
    tag = "Switchboard",
    path = "/metrics",
    responses((status = 200, description = "Prometheus Metrics", body = String))
)]
async fn metrics(prom_handle: Extension<PrometheusHandle>) -> String {
    prom_handle.render()
}

async fn openapi_doc() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[derive(OpenApi)]
#[openapi(
    paths(generate, get_info, health, metrics),
    tags((name = "Switchboard", description = "Inference request front end")),
    components(schemas(
        Info,
        GenerateRequest,
        ChatMessage,
        ResponseEnvelope,
        ErrorResponse,
    ))
)]
struct ApiDoc;

/// Serving method
#[allow(clippy::too_many_arguments)]
pub async fn run(
    engine: Arc<dyn Engine>,
    chat_template: Option<ChatTemplate>,
    max_concurrent_requests: usize,
    max_batch_size: usize,
    max_batch_delay: Duration,
    addr: SocketAddr,
    cors_allow_origin: Option<AllowOrigin>,
) -> Result<(), axum::BoxError> {
    let engine_kind = engine.kind();
    let normalizer = PromptNormalizer::new(chat_template);
    let has_chat_template = normalizer.has_chat_template();
    let validation = Validation::new(normalizer, engine_kind);
    let infer = Infer::new(
        engine,
        validation,
        max_batch_size,
        max_batch_delay,
        max_concurrent_requests,
    );

    // Duration buckets
    let duration_matcher = Matcher::Suffix(String::from("duration"));
    let n_duration_buckets = 35;
    let mut duration_buckets = Vec::with_capacity(n_duration_buckets);
    // Minimum duration in seconds
    let mut value = 0.0001;
    for _ in 0..n_duration_buckets {
        // geometric sequence
        value *= 1.5;
        duration_buckets.push(value);
    }
    // Batch size buckets
    let batch_size_matcher = Matcher::Full(String::from("switchboard_batch_next_size"));
    let batch_size_buckets: Vec<f64> = (0..max_batch_size).map(|x| (x + 1) as f64).collect();
    // Generated tokens buckets
    let generated_tokens_matcher =
        Matcher::Full(String::from("switchboard_request_generated_tokens"));
    let generated_tokens_buckets: Vec<f64> = (0..12).map(|x| 2.0_f64.powi(x)).collect();

    // Prometheus handler
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(duration_matcher, &duration_buckets)?
        .set_buckets_for_metric(batch_size_matcher, &batch_size_buckets)?
        .set_buckets_for_metric(generated_tokens_matcher, &generated_tokens_buckets)?;
    let prom_handle = builder.install_recorder()?;

    // CORS allowed origins
    let allow_origin: AllowOrigin = cors_allow_origin.unwrap_or(AllowOrigin::any());
    let cors_layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(allow_origin);

    let info = Info {
        engine: engine_kind.as_str(),
        max_concurrent_requests,
        max_batch_size,
        max_batch_delay_ms: max_batch_delay.as_millis() as u64,
        chat_template: has_chat_template,
        version: env!("CARGO_PKG_VERSION"),
    };

    // Create router
    let app = Router::new()
        .route("/", post(generate).get(health))
        .route("/info", get(get_info))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api-doc/openapi.json", get(openapi_doc))
        .layer(Extension(info))
        .layer(Extension(infer))
        .layer(Extension(prom_handle))
        .layer(cors_layer);

    // Run server
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
}

fn error_response(err: InferError) -> Response {
    metrics::increment_counter!("switchboard_request_failure", "err" => err.error_type().to_string());
    tracing::error!("{err}");
    let (status, body) = <(StatusCode, Json<ErrorResponse>)>::from(err);
    (status, body).into_response()
}

impl From<InferError> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: InferError) -> Self {
        let status_code = match err {
            InferError::GenerationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            InferError::Overloaded(_) => StatusCode::TOO_MANY_REQUESTS,
            InferError::ValidationError(_) => StatusCode::BAD_REQUEST,
            InferError::IncompleteGeneration => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status_code,
            Json(ErrorResponse {
                error: err.to_string(),
                error_type: err.error_type().to_string(),
            }),
        )
    }
}
