// Based on https://github.com/LukeMathWalker/tracing-actix-web/blob/main/examples/opentelemetry/src/main.rs#L15
fn init_telemetry(service_name: &str) {
    use opentelemetry::global;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use opentelemetry_sdk::runtime::TokioCurrentThread;
    use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::{EnvFilter, Registry};

    global::set_text_map_propagator(TraceContextPropagator::new());
    #[allow(deprecated)]
    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(service_name)
        .install_batch(TokioCurrentThread)
        .expect("Failed to install OpenTelemetry tracer.");

    // Tunable via `RUST_LOG` env variable
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let formatting_layer = BunyanFormattingLayer::new(service_name.into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(telemetry)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to install `tracing` subscriber.")
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    use std::sync::Arc;

    use actix_web::{web, App, HttpServer};
    use anyhow::Context;
    use paperclip::actix::OpenApiExt;
    use tracing_actix_web::TracingLogger;

    use circulation_engine::notifications::{NotificationSink, TracingNotificationSink};
    use circulation_engine::store::{
        CirculationStore, InMemoryCirculationStore, PostgresCirculationStore,
        PostgresCirculationStoreConfig,
    };
    use circulation_engine::Circulation;
    use circulation_service::app_config::config_app;
    use circulation_service::settings::Settings;
    use circulation_service::sweep_scheduler::SweepScheduler;
    use circulation_service::webhook_sink::WebhookNotificationSink;

    let settings = Settings::load()?;
    init_telemetry(&settings.telemetry.service_name);

    let store: Arc<dyn CirculationStore> = if settings.database.use_in_memory {
        tracing::warn!("Using in-memory store, nothing survives a restart");
        Arc::new(InMemoryCirculationStore::new())
    } else {
        Arc::new(
            PostgresCirculationStore::init(PostgresCirculationStoreConfig {
                hostname: settings.database.hostname.clone(),
                username: settings.database.username.clone(),
                password: settings.database.password.clone(),
                pool_size: settings.database.pool_size,
            })
            .await
            .context("Failed to init postgres")?,
        )
    };
    let notifications: Arc<dyn NotificationSink> = match &settings.notifications.webhook_url {
        Some(url) => Arc::new(WebhookNotificationSink::new(url)?),
        None => Arc::new(TracingNotificationSink),
    };
    let circulation = Arc::new(Circulation::new(store, notifications, &settings.policy));

    // Copies that came back while the service was down
    match circulation.reconcile_availability().await {
        Ok(report) => tracing::info!(
            processed = report.processed,
            loans_created = report.loans_created,
            "Start-up reconciliation finished"
        ),
        Err(err) => tracing::error!("Start-up reconciliation failed {}", err),
    }

    actix_web::rt::spawn(
        SweepScheduler::new(circulation.clone(), settings.sweeper.interval()).start(),
    );

    tracing::info!(
        "starting HTTP server at http://{}:{}",
        settings.server.host,
        settings.server.port
    );
    HttpServer::new(move || {
        App::new()
            .wrap_api()
            .app_data(web::Data::new(circulation.clone()))
            .wrap(TracingLogger::default())
            .configure(config_app)
            .with_json_spec_at("/apispec/v2")
            .build()
    })
    .bind((settings.server.host.as_str(), settings.server.port))?
    .run()
    .await?;
    Ok(())
}
