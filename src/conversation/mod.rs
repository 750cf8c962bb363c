use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{GarageBotError, Result};
use crate::interfaces::notifier::Notifier;
use crate::store::{
    now_ts, FuelEvent, GarageStore, InsurancePolicy, MaintenanceEvent, OdometerUpdate,
    RecurringItem, Vehicle,
};

pub mod flow;
pub mod phase;

pub use flow::{CallbackToken, Choice, FlowKind, FlowState, UserInput};

use flow::{CommitKind, FlowContext, StartOutcome, StepAction};
use phase::{Phase, PhaseAction};

/// One in-flight data-entry flow. Field values accumulate in a plain json
/// map keyed by field name; nothing touches the store until the terminal
/// commit, so dropping the session is always side-effect free.
#[derive(Debug)]
pub struct ConversationSession {
    pub flow: FlowKind,
    pub state: FlowState,
    pub phase: Phase,
    pub fields: Map<String, Value>,
    pub started_at: Instant,
    pub updated_at: Instant,
}

impl ConversationSession {
    fn expired(&self, ttl: Duration) -> bool {
        self.updated_at.elapsed() > ttl
    }
}

#[derive(Debug, Clone)]
pub enum Committed {
    Vehicle(Vehicle),
    OdometerUpdated {
        vehicle_id: i32,
        from: f64,
        to: f64,
    },
    VehicleDeactivated {
        vehicle_id: i32,
    },
    Fuel(FuelEvent),
    Maintenance(MaintenanceEvent),
    Insurance(InsurancePolicy),
    ServicePlan {
        vehicle_id: i32,
        interval_km: Option<f64>,
        interval_months: Option<i32>,
    },
    RecurringItem(RecurringItem),
    SupportRelayed {
        delivered: bool,
    },
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Reprompt(String),
    Advance(String),
    Complete { entity: Committed, message: String },
    Cancelled(String),
}

impl SubmitOutcome {
    pub fn message(&self) -> &str {
        match self {
            SubmitOutcome::Reprompt(msg)
            | SubmitOutcome::Advance(msg)
            | SubmitOutcome::Cancelled(msg) => msg,
            SubmitOutcome::Complete { message, .. } => message,
        }
    }
}

enum CommitResult {
    Done(Committed, String),
    VehicleGone,
    Refused(String),
}

pub struct ConversationEngine {
    store: Arc<GarageStore>,
    config: Arc<Config>,
    notifier: Arc<dyn Notifier>,
    sessions: Mutex<HashMap<String, ConversationSession>>,
}

impl ConversationEngine {
    pub fn new(store: Arc<GarageStore>, config: Arc<Config>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            config,
            notifier,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a flow for the user, implicitly discarding any unfinished one.
    /// Returns the first prompt, or a refusal message when the flow cannot
    /// start (e.g. no registered vehicles).
    pub async fn start(&self, flow: FlowKind, user_id: &str) -> Result<String> {
        let vehicles = self.store.list_vehicles(user_id).await?;
        let ctx = FlowContext {
            config: &self.config,
            vehicles: &vehicles,
            today: Utc::now().date_naive(),
        };

        match flow::start_state(flow, &ctx) {
            StartOutcome::Refused(message) => {
                let mut sessions = self.sessions.lock().await;
                sessions.remove(user_id);
                Ok(message)
            }
            StartOutcome::Begin {
                state,
                fields,
                prompt,
            } => {
                let now = Instant::now();
                // single-vehicle auto-selection can land straight on a
                // confirmation state (e.g. vehicle removal)
                let phase = if state.is_confirmation() {
                    Phase::Confirming
                } else {
                    Phase::Active
                };
                let session = ConversationSession {
                    flow,
                    state,
                    phase,
                    fields,
                    started_at: now,
                    updated_at: now,
                };
                let mut sessions = self.sessions.lock().await;
                sessions.insert(user_id.to_string(), session);
                Ok(prompt)
            }
        }
    }

    pub async fn has_active_session(&self, user_id: &str) -> bool {
        let ttl = self.config.session_ttl();
        let mut sessions = self.sessions.lock().await;
        match sessions.get(user_id) {
            Some(session) if session.expired(ttl) => {
                sessions.remove(user_id);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Drops the user's session, if any. Used when an unrelated command
    /// arrives mid-flow; no partial data survives.
    pub async fn discard(&self, user_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(user_id).is_some()
    }

    pub async fn submit(&self, user_id: &str, input: UserInput) -> Result<SubmitOutcome> {
        // the map lock is held across the whole submit, which serializes
        // processing per process the way the original message loop did
        let mut sessions = self.sessions.lock().await;
        let ttl = self.config.session_ttl();

        let session = match sessions.get_mut(user_id) {
            Some(session) => session,
            None => {
                return Err(GarageBotError::Validation(
                    "no active conversation for this user".to_string(),
                ))
            }
        };
        if session.expired(ttl) {
            sessions.remove(user_id);
            return Ok(SubmitOutcome::Cancelled(
                "Your previous entry timed out and was discarded. Start again.".to_string(),
            ));
        }

        let vehicles = self.store.list_vehicles(user_id).await?;
        let ctx = FlowContext {
            config: &self.config,
            vehicles: &vehicles,
            today: Utc::now().date_naive(),
        };

        let action = flow::handle(
            session.flow,
            session.state,
            &input,
            &mut session.fields,
            &ctx,
        );
        session.updated_at = Instant::now();

        match action {
            StepAction::Reprompt(message) => Ok(SubmitOutcome::Reprompt(message)),
            StepAction::Advance { next, prompt } => {
                let phase_action = if next.is_confirmation() {
                    PhaseAction::ShowConfirm
                } else {
                    PhaseAction::Note
                };
                session.phase = self.apply_phase(session.phase, phase_action)?;
                session.state = next;
                Ok(SubmitOutcome::Advance(prompt))
            }
            StepAction::Cancel(message) => {
                self.apply_phase(session.phase, PhaseAction::Cancel)?;
                sessions.remove(user_id);
                Ok(SubmitOutcome::Cancelled(message))
            }
            StepAction::Commit(kind) => {
                let phase_action = if session.state.is_confirmation() {
                    PhaseAction::Affirm
                } else {
                    PhaseAction::Finish
                };
                self.apply_phase(session.phase, phase_action)?;
                let flow = session.flow;
                let fields = session.fields.clone();
                sessions.remove(user_id);
                // lock stays held: the commit is part of this submit
                match self.commit(kind, flow, user_id, &fields).await? {
                    CommitResult::Done(entity, message) => {
                        Ok(SubmitOutcome::Complete { entity, message })
                    }
                    CommitResult::VehicleGone => Ok(SubmitOutcome::Cancelled(
                        "That vehicle no longer exists, so nothing was saved.".to_string(),
                    )),
                    CommitResult::Refused(message) => Ok(SubmitOutcome::Cancelled(message)),
                }
            }
            StepAction::CommitThen {
                kind,
                next,
                prompt,
            } => {
                session.phase = self.apply_phase(session.phase, PhaseAction::Branch)?;
                let flow = session.flow;
                let fields_snapshot = session.fields.clone();
                match self.commit(kind, flow, user_id, &fields_snapshot).await? {
                    CommitResult::Done(entity, _) => {
                        if let Committed::Maintenance(event) = &entity {
                            // carried into the recurring-item upsert as its baseline
                            flow::put_i64(&mut session.fields, "event_at", event.occurred_at);
                        }
                        session.state = next;
                        Ok(SubmitOutcome::Advance(prompt))
                    }
                    CommitResult::VehicleGone => {
                        sessions.remove(user_id);
                        Ok(SubmitOutcome::Cancelled(
                            "That vehicle no longer exists, so nothing was saved.".to_string(),
                        ))
                    }
                    CommitResult::Refused(message) => {
                        sessions.remove(user_id);
                        Ok(SubmitOutcome::Cancelled(message))
                    }
                }
            }
        }
    }

    fn apply_phase(&self, current: Phase, action: PhaseAction) -> Result<Phase> {
        phase::transition(current, action).ok_or_else(|| {
            GarageBotError::Runtime(format!(
                "illegal session phase transition: {current:?} on {action:?}"
            ))
        })
    }

    async fn commit(
        &self,
        kind: CommitKind,
        flow: FlowKind,
        user_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<CommitResult> {
        match kind {
            CommitKind::Vehicle => self.commit_vehicle(user_id, fields).await,
            CommitKind::OdometerUpdate { allow_decrease } => {
                self.commit_odometer(user_id, fields, allow_decrease).await
            }
            CommitKind::DeactivateVehicle => self.commit_deactivate(user_id, fields).await,
            CommitKind::FuelEvent => self.commit_fuel(user_id, fields).await,
            CommitKind::MaintenanceEvent => self.commit_maintenance(user_id, fields).await,
            CommitKind::InsurancePolicy => self.commit_insurance(user_id, fields).await,
            CommitKind::ServicePlan => self.commit_service_plan(user_id, fields).await,
            CommitKind::RecurringItem => self.commit_recurring_item(user_id, fields).await,
            CommitKind::SupportMessage => self.commit_support(user_id, flow, fields).await,
        }
    }

    async fn commit_vehicle(
        &self,
        user_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<CommitResult> {
        let brand = flow::get_str(fields, "brand").unwrap_or_default();
        let model = flow::get_str(fields, "model").unwrap_or_default();
        let year = flow::get_i64(fields, "year").unwrap_or_default() as i32;
        let odometer = flow::get_f64(fields, "odometer").unwrap_or_default();
        let fuel_type = flow::get_str(fields, "fuel_type").unwrap_or("petrol");

        let vehicle = self
            .store
            .create_vehicle(crate::store::NewVehicle {
                owner_id: user_id,
                brand,
                model,
                year,
                nickname: flow::get_str(fields, "nickname"),
                odometer_km: odometer,
                fuel_type,
            })
            .await?;
        let message = format!(
            "Vehicle saved: {} at {:.0} km. You can now log fuel, maintenance, and insurance for it.",
            vehicle.label(),
            vehicle.odometer_km
        );
        tracing::info!(user_id, vehicle_id = vehicle.id, "vehicle registered");
        Ok(CommitResult::Done(Committed::Vehicle(vehicle), message))
    }

    async fn require_vehicle(
        &self,
        user_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<Option<Vehicle>> {
        let id = match flow::get_i64(fields, "vehicle_id") {
            Some(id) => id as i32,
            None => return Ok(None),
        };
        self.store.get_owned_vehicle(user_id, id).await
    }

    async fn commit_odometer(
        &self,
        user_id: &str,
        fields: &Map<String, Value>,
        allow_decrease: bool,
    ) -> Result<CommitResult> {
        let vehicle = match self.require_vehicle(user_id, fields).await? {
            Some(vehicle) => vehicle,
            None => return Ok(CommitResult::VehicleGone),
        };
        let new_km = flow::get_f64(fields, "new_odometer").unwrap_or_default();
        match self
            .store
            .update_odometer(vehicle.id, new_km, allow_decrease)
            .await?
        {
            OdometerUpdate::Updated { from, to } => {
                let message = if to >= from {
                    format!(
                        "Odometer updated: {from:.0} km -> {to:.0} km (+{:.1} km).",
                        to - from
                    )
                } else {
                    format!("Odometer lowered: {from:.0} km -> {to:.0} km.")
                };
                Ok(CommitResult::Done(
                    Committed::OdometerUpdated {
                        vehicle_id: vehicle.id,
                        from,
                        to,
                    },
                    message,
                ))
            }
            OdometerUpdate::RejectedDecrease { current } => Ok(CommitResult::Refused(format!(
                "The reading is below the stored {current:.0} km, so nothing was changed."
            ))),
        }
    }

    async fn commit_deactivate(
        &self,
        user_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<CommitResult> {
        let vehicle = match self.require_vehicle(user_id, fields).await? {
            Some(vehicle) => vehicle,
            None => return Ok(CommitResult::VehicleGone),
        };
        if !self.store.deactivate_vehicle(user_id, vehicle.id).await? {
            return Ok(CommitResult::VehicleGone);
        }
        let message = format!(
            "{} was removed from your garage. Its records are kept for statistics.",
            vehicle.label()
        );
        Ok(CommitResult::Done(
            Committed::VehicleDeactivated {
                vehicle_id: vehicle.id,
            },
            message,
        ))
    }

    async fn commit_fuel(
        &self,
        user_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<CommitResult> {
        let vehicle = match self.require_vehicle(user_id, fields).await? {
            Some(vehicle) => vehicle,
            None => return Ok(CommitResult::VehicleGone),
        };
        let liters = flow::get_f64(fields, "liters").unwrap_or_default();
        let cost = flow::get_f64(fields, "cost").unwrap_or_default();
        let event = self
            .store
            .record_fuel_event(
                vehicle.id,
                now_ts(),
                flow::get_f64(fields, "event_odometer"),
                liters,
                cost,
                flow::get_str(fields, "fuel_type"),
            )
            .await?;
        let message = format!(
            "Fuel logged for {}: {liters:.2} l for {cost:.2} ({:.2} per liter).",
            vehicle.label(),
            cost / liters
        );
        Ok(CommitResult::Done(Committed::Fuel(event), message))
    }

    async fn commit_maintenance(
        &self,
        user_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<CommitResult> {
        let vehicle = match self.require_vehicle(user_id, fields).await? {
            Some(vehicle) => vehicle,
            None => return Ok(CommitResult::VehicleGone),
        };
        let category = flow::get_str(fields, "category").unwrap_or("other");
        let description = flow::get_str(fields, "description").unwrap_or_default();
        let event = self
            .store
            .record_maintenance_event(
                vehicle.id,
                now_ts(),
                flow::get_f64(fields, "event_odometer"),
                flow::get_f64(fields, "cost").unwrap_or_default(),
                description,
                category,
            )
            .await?;
        let mut message = format!(
            "Maintenance logged for {}: {} ({:.2}).",
            vehicle.label(),
            description,
            event.cost
        );
        if category == crate::store::SERVICE_CATEGORY {
            message.push_str(" Service reminder baseline was reset.");
        }
        Ok(CommitResult::Done(Committed::Maintenance(event), message))
    }

    async fn commit_insurance(
        &self,
        user_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<CommitResult> {
        let vehicle = match self.require_vehicle(user_id, fields).await? {
            Some(vehicle) => vehicle,
            None => return Ok(CommitResult::VehicleGone),
        };
        let end_date = flow::get_i64(fields, "end_date").unwrap_or_default();
        let policy = self
            .store
            .add_insurance(
                vehicle.id,
                end_date,
                flow::get_f64(fields, "cost").unwrap_or_default(),
                flow::get_str(fields, "policy_number"),
                flow::get_str(fields, "company"),
                flow::get_str(fields, "notes"),
            )
            .await?;
        let message = format!(
            "Insurance saved for {}: valid until {}.",
            vehicle.label(),
            flow::epoch_to_date_label(policy.end_date)
        );
        Ok(CommitResult::Done(Committed::Insurance(policy), message))
    }

    async fn commit_service_plan(
        &self,
        user_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<CommitResult> {
        let vehicle = match self.require_vehicle(user_id, fields).await? {
            Some(vehicle) => vehicle,
            None => return Ok(CommitResult::VehicleGone),
        };
        let interval_km = flow::get_f64(fields, "interval_km").filter(|km| *km > 0.0);
        let interval_months = flow::get_i64(fields, "interval_months")
            .map(|months| months as i32)
            .filter(|months| *months > 0);
        self.store
            .set_service_plan(vehicle.id, interval_km, interval_months)
            .await?;
        let km_label = interval_km
            .map(|km| format!("{km:.0} km"))
            .unwrap_or_else(|| "disabled".to_string());
        let months_label = interval_months
            .map(|months| format!("{months} months"))
            .unwrap_or_else(|| "disabled".to_string());
        let message = format!(
            "Service reminders for {}: distance {km_label}, time {months_label}.",
            vehicle.label()
        );
        Ok(CommitResult::Done(
            Committed::ServicePlan {
                vehicle_id: vehicle.id,
                interval_km,
                interval_months,
            },
            message,
        ))
    }

    async fn commit_recurring_item(
        &self,
        user_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<CommitResult> {
        let vehicle = match self.require_vehicle(user_id, fields).await? {
            Some(vehicle) => vehicle,
            None => return Ok(CommitResult::VehicleGone),
        };
        let name = flow::get_str(fields, "description").unwrap_or("part");
        let interval_km = flow::get_f64(fields, "item_interval_km").filter(|km| *km > 0.0);
        let interval_months = flow::get_i64(fields, "item_interval_months")
            .map(|months| months as i32)
            .filter(|months| *months > 0);
        let last_odometer = flow::get_f64(fields, "event_odometer").or(Some(vehicle.odometer_km));
        let last_date = flow::get_i64(fields, "event_at").or_else(|| Some(now_ts()));

        let item = self
            .store
            .upsert_recurring_item(
                vehicle.id,
                name,
                last_odometer,
                last_date,
                interval_km,
                interval_months,
            )
            .await?;
        let message = if interval_km.is_none() && interval_months.is_none() {
            format!(
                "Replacement of '{}' recorded for {} with no reminder intervals.",
                item.name,
                vehicle.label()
            )
        } else {
            format!(
                "Replacement of '{}' recorded for {}; you will be reminded when it is due again.",
                item.name,
                vehicle.label()
            )
        };
        Ok(CommitResult::Done(Committed::RecurringItem(item), message))
    }

    async fn commit_support(
        &self,
        user_id: &str,
        _flow: FlowKind,
        fields: &Map<String, Value>,
    ) -> Result<CommitResult> {
        let body = flow::get_str(fields, "message").unwrap_or_default();
        let admin = match &self.config.admin_chat_id {
            Some(admin) => admin.clone(),
            None => {
                return Ok(CommitResult::Done(
                    Committed::SupportRelayed { delivered: false },
                    "Support contact is not configured; your message was not sent.".to_string(),
                ))
            }
        };
        let rendered = format!("New message from a user\nID: {user_id}\n\n{body}");
        match self.notifier.send(&admin, &rendered).await {
            Ok(()) => Ok(CommitResult::Done(
                Committed::SupportRelayed { delivered: true },
                "Your message was forwarded to the administrator.".to_string(),
            )),
            Err(err) => {
                tracing::warn!(user_id, "support relay failed: {err}");
                Ok(CommitResult::Done(
                    Committed::SupportRelayed { delivered: false },
                    "The message could not be delivered right now. Try again later.".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::notifier::NoopNotifier;

    async fn test_engine() -> (tempfile::TempDir, ConversationEngine) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("garage.db");
        let store = Arc::new(
            GarageStore::new(db_path.to_string_lossy())
                .await
                .expect("store"),
        );
        let engine = ConversationEngine::new(
            store,
            Arc::new(Config::convention_defaults()),
            Arc::new(NoopNotifier),
        );
        (dir, engine)
    }

    #[tokio::test]
    async fn submit_without_session_is_an_error() {
        let (_dir, engine) = test_engine().await;
        let outcome = engine
            .submit("u1", UserInput::Text("hello".to_string()))
            .await;
        assert!(outcome.is_err());
        assert!(!engine.has_active_session("u1").await);
    }

    #[tokio::test]
    async fn starting_a_new_flow_discards_the_previous_one() {
        let (_dir, engine) = test_engine().await;
        engine
            .start(FlowKind::RegisterVehicle, "u1")
            .await
            .expect("start register");
        engine
            .start(FlowKind::ContactSupport, "u1")
            .await
            .expect("start support");

        // the live session is now the support flow, so a brand pick is
        // rejected while free text lands as the support message body
        let outcome = engine
            .submit("u1", UserInput::Text("does the export work?".to_string()))
            .await
            .expect("submit");
        match outcome {
            SubmitOutcome::Complete {
                entity: Committed::SupportRelayed { .. },
                ..
            } => {}
            other => panic!("expected support relay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_session_is_discarded_on_submit() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("garage.db");
        let store = Arc::new(
            GarageStore::new(db_path.to_string_lossy())
                .await
                .expect("store"),
        );
        let mut config = Config::convention_defaults();
        config.session_ttl_secs = 1;
        let engine =
            ConversationEngine::new(store, Arc::new(config), Arc::new(NoopNotifier));

        engine
            .start(FlowKind::RegisterVehicle, "u1")
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let outcome = engine
            .submit("u1", UserInput::Text("Toyota".to_string()))
            .await
            .expect("submit");
        assert!(matches!(outcome, SubmitOutcome::Cancelled(_)));
        assert!(!engine.has_active_session("u1").await);
    }
}
