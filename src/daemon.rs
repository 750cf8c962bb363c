use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::commands::CommandRouter;
use crate::config::Config;
use crate::conversation::ConversationEngine;
use crate::error::Result;
use crate::export;
use crate::interfaces::notifier::{NoopNotifier, Notifier, WebhookNotifier};
use crate::interfaces::scheduler::ScheduledJob;
use crate::reminders::ReminderEngine;
use crate::scheduler::{seconds, Scheduler};
use crate::store::{now_ts, GarageStore};

#[derive(Clone)]
pub struct AppState {
    pub commands: Arc<CommandRouter>,
    pub store: Arc<GarageStore>,
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    user_id: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    reply: String,
}

struct InsuranceCheckJob {
    engine: Arc<ReminderEngine>,
    interval: Duration,
}

#[async_trait::async_trait]
impl ScheduledJob for InsuranceCheckJob {
    fn name(&self) -> &str {
        "insurance_check"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let summary = self.engine.evaluate_insurance(now_ts()).await?;
        tracing::debug!(
            dispatched = summary.dispatched,
            failed = summary.failed,
            "insurance check finished"
        );
        Ok(())
    }
}

struct ServiceCheckJob {
    engine: Arc<ReminderEngine>,
    interval: Duration,
}

#[async_trait::async_trait]
impl ScheduledJob for ServiceCheckJob {
    fn name(&self) -> &str {
        "service_check"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let summary = self.engine.evaluate_service(now_ts()).await?;
        tracing::debug!(
            dispatched = summary.dispatched,
            failed = summary.failed,
            "service check finished"
        );
        Ok(())
    }
}

struct RecurringCheckJob {
    engine: Arc<ReminderEngine>,
    interval: Duration,
}

#[async_trait::async_trait]
impl ScheduledJob for RecurringCheckJob {
    fn name(&self) -> &str {
        "recurring_check"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let summary = self.engine.evaluate_recurring(now_ts()).await?;
        tracing::debug!(
            dispatched = summary.dispatched,
            failed = summary.failed,
            "recurring item check finished"
        );
        Ok(())
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/message", post(message))
        .route("/export/{user_id}", get(export_csv))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("GARAGE_GIT_SHA"),
    }))
}

async fn message(
    State(state): State<AppState>,
    Json(request): Json<MessageRequest>,
) -> impl IntoResponse {
    if request.user_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "user_id must not be empty"})),
        )
            .into_response();
    }
    match state
        .commands
        .handle_message(request.user_id.trim(), &request.text)
        .await
    {
        Ok(reply) => Json(MessageResponse { reply }).into_response(),
        Err(err) => {
            tracing::error!(user_id = request.user_id, "message handling failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn export_csv(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match export::owner_csv(&state.store, &user_id).await {
        Ok(csv) => ([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv).into_response(),
        Err(err) => {
            tracing::error!(user_id, "export failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

/// Wires the store, engines, scheduler, and HTTP surface together and
/// serves until the process is stopped.
pub async fn run(config: Config, db_path: String, bind: String) -> Result<()> {
    let config = Arc::new(config);
    let store = Arc::new(GarageStore::new(&db_path).await?);

    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => {
            tracing::warn!("no webhook configured; reminders will be dropped");
            Arc::new(NoopNotifier)
        }
    };

    let engine = Arc::new(ConversationEngine::new(
        store.clone(),
        config.clone(),
        notifier.clone(),
    ));
    let commands = Arc::new(CommandRouter::new(
        store.clone(),
        config.clone(),
        engine,
        notifier.clone(),
    ));
    let reminders = Arc::new(ReminderEngine::new(store.clone(), notifier));

    let mut scheduler = Scheduler::new();
    scheduler.register_job(Arc::new(InsuranceCheckJob {
        engine: reminders.clone(),
        interval: seconds(config.schedule.insurance_check_secs),
    }));
    scheduler.register_job(Arc::new(ServiceCheckJob {
        engine: reminders.clone(),
        interval: seconds(config.schedule.service_check_secs),
    }));
    scheduler.register_job(Arc::new(RecurringCheckJob {
        engine: reminders,
        interval: seconds(config.schedule.recurring_check_secs),
    }));
    scheduler.start();

    let state = AppState {
        commands,
        store,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| crate::error::GarageBotError::Runtime(e.to_string()))?;
    tracing::info!(bind, db_path, "garage-bot daemon listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::GarageBotError::Runtime(e.to_string()))?;

    scheduler.stop().await;
    Ok(())
}
