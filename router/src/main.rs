use axum::http::HeaderValue;
use clap::Parser;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use switchboard_backend::mock::MockEngine;
use switchboard_backend::{Engine, EngineKind};
use switchboard_router::server;
use switchboard_router::ChatTemplate;
use thiserror::Error;
use tower_http::cors::AllowOrigin;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(default_value = "128", long, env)]
    max_concurrent_requests: usize,
    #[clap(default_value = "4", long, env)]
    max_batch_size: usize,
    #[clap(default_value = "10", long, env)]
    max_batch_delay_ms: u64,
    #[clap(default_value = "single-process", long, env)]
    engine: String,
    #[clap(long, env)]
    chat_processor: Option<String>,
    #[clap(long, env)]
    chat_template_file: Option<String>,
    #[clap(default_value = "0.0.0.0", long, env)]
    hostname: String,
    #[clap(default_value = "3000", long, short, env)]
    port: u16,
    #[clap(long, env)]
    json_output: bool,
    #[clap(long, env)]
    cors_allow_origin: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<(), RouterError> {
    // Get args
    let args = Args::parse();
    // Pattern match configuration
    let Args {
        max_concurrent_requests,
        max_batch_size,
        max_batch_delay_ms,
        engine,
        chat_processor,
        chat_template_file,
        hostname,
        port,
        json_output,
        cors_allow_origin,
    } = args;

    init_logging(json_output);

    // Validate args
    if max_batch_size == 0 {
        return Err(RouterError::ArgumentValidation(
            "`max_batch_size` must be > 0".to_string(),
        ));
    }
    if max_concurrent_requests == 0 {
        return Err(RouterError::ArgumentValidation(
            "`max_concurrent_requests` must be > 0".to_string(),
        ));
    }

    let engine_kind: EngineKind = engine
        .parse()
        .map_err(RouterError::ArgumentValidation)?;

    let chat_template = resolve_chat_template(chat_processor, chat_template_file)?;

    // CORS allowed origins
    // map to go inside the option and then map to parse from String to HeaderValue
    // Finally, convert to AllowOrigin
    let cors_allow_origin: Option<AllowOrigin> = cors_allow_origin.map(|cors_allow_origin| {
        AllowOrigin::list(
            cors_allow_origin
                .iter()
                .map(|origin| origin.parse::<HeaderValue>().unwrap()),
        )
    });

    let addr = match hostname.parse() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            tracing::warn!("Invalid hostname, defaulting to 0.0.0.0");
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port)
        }
    };

    // The mock engine stands in until a real engine implementation is
    // wired through `server::run`
    let engine: Arc<dyn Engine> = Arc::new(MockEngine::new(engine_kind));

    server::run(
        engine,
        chat_template,
        max_concurrent_requests,
        max_batch_size,
        Duration::from_millis(max_batch_delay_ms),
        addr,
        cors_allow_origin,
    )
    .await
    .map_err(|err| RouterError::WebServer(err.to_string()))?;
    Ok(())
}

fn resolve_chat_template(
    chat_processor: Option<String>,
    chat_template_file: Option<String>,
) -> Result<Option<ChatTemplate>, RouterError> {
    match (chat_processor, chat_template_file) {
        (Some(_), Some(_)) => Err(RouterError::ArgumentValidation(
            "`--chat-processor` and `--chat-template-file` are mutually exclusive".to_string(),
        )),
        (Some(name), None) => {
            let source = ChatTemplate::builtin(&name)
                .ok_or_else(|| RouterError::ChatProcessorNotFound(name.clone()))?;
            ChatTemplate::new(source.to_string())
                .map(Some)
                .map_err(|err| RouterError::ArgumentValidation(err.to_string()))
        }
        (None, Some(path)) => {
            let source = fs::read_to_string(&path).map_err(|err| {
                RouterError::ArgumentValidation(format!(
                    "failed to read chat template file `{path}`: {err}"
                ))
            })?;
            ChatTemplate::new(source)
                .map(Some)
                .map_err(|err| RouterError::ArgumentValidation(err.to_string()))
        }
        (None, None) => Ok(None),
    }
}

/// Init logging using LOG_LEVEL
fn init_logging(json_output: bool) {
    // STDOUT layer
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true);

    let fmt_layer = match json_output {
        true => fmt_layer.json().flatten_event(true).boxed(),
        false => fmt_layer.boxed(),
    };

    // Filter events with LOG_LEVEL
    let env_filter =
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[derive(Debug, Error)]
enum RouterError {
    #[error("Argument validation error: {0}")]
    ArgumentValidation(String),
    #[error("chat processor `{0}` does not exist; deployment refused to start")]
    ChatProcessorNotFound(String),
    #[error("WebServer error: {0}")]
    WebServer(String),
}
