use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use imagecache::{
    application::{error::AppError, pipeline::RequestPipeline},
    cache::DiskCacheStore,
    config,
    domain::{
        error::DomainError,
        options::{ImageOptions, RawOptions},
        signature,
    },
    infra::{
        error::InfraError,
        http::{self, HttpState},
        origin::ObjectStoreOrigin,
        telemetry,
        transform::ImageCrateTransformer,
    },
};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

/// Characters escaped when printing a signed path.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');
const OPTIONS_SEGMENT: &AsciiSet = &PATH_SEGMENT.add(b'/');

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging)?;
            run_serve(settings).await
        }
        config::Command::Sign(args) => run_sign(&settings, &args),
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    info!(
        target = "imagecache::serve",
        addr = %settings.server.addr,
        cache_directory = %settings.cache.directory.display(),
        coalesce_image_misses = settings.cache.coalesce_image_misses,
        origin = ?settings.origin,
        "starting imagecache"
    );

    let store = DiskCacheStore::new(settings.cache.directory.clone())
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let origin = ObjectStoreOrigin::from_settings(&settings.origin)?;
    let pipeline = RequestPipeline::new(
        store,
        Arc::new(origin),
        Arc::new(ImageCrateTransformer::new()),
        settings.signing.key.expose().as_bytes().to_vec(),
        settings.cache.coalesce_image_misses,
    );
    let router = http::build_router(HttpState::new(pipeline));

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    let draining = Arc::new(Notify::new());
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown({
            let draining = Arc::clone(&draining);
            async move {
                wait_for_shutdown_signal().await;
                info!(target = "imagecache::serve", "shutdown signal received; draining");
                draining.notify_one();
            }
        })
        .into_future();

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        _ = drain_deadline(&draining, settings.server.graceful_shutdown) => {
            warn!(
                target = "imagecache::serve",
                grace_seconds = settings.server.graceful_shutdown.as_secs(),
                "graceful shutdown timed out; dropping open connections"
            );
        }
    }

    Ok(())
}

async fn drain_deadline(draining: &Notify, grace: Duration) {
    draining.notified().await;
    tokio::time::sleep(grace).await;
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = "imagecache::serve", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(target = "imagecache::serve", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn run_sign(settings: &config::Settings, args: &config::SignArgs) -> Result<(), AppError> {
    if args.kind == config::SignKind::Image {
        ImageOptions::from_raw(&RawOptions::parse(&args.options)).map_err(DomainError::from)?;
    }

    let object_path = args.object_path.trim_start_matches('/');
    if object_path.is_empty() {
        return Err(AppError::validation("object path must not be empty"));
    }

    let token = signature::sign(
        settings.signing.key.expose().as_bytes(),
        &args.options,
        object_path,
    );
    println!(
        "/{}/{}/{}/{}",
        args.kind.route(),
        utf8_percent_encode(&token, PATH_SEGMENT),
        utf8_percent_encode(&args.options, OPTIONS_SEGMENT),
        utf8_percent_encode(object_path, PATH_SEGMENT),
    );

    Ok(())
}
