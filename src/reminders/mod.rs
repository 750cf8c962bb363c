use std::sync::Arc;

use crate::error::Result;
use crate::interfaces::notifier::Notifier;
use crate::store::{
    GarageStore, InsurancePolicy, RecurringItem, SubjectKind, ThresholdKind, Vehicle,
};

pub const DAY_SECONDS: i64 = 86_400;

/// Months are approximated as 30 days for every date-based interval.
pub fn months_to_seconds(months: i32) -> i64 {
    months as i64 * 30 * DAY_SECONDS
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EvaluationSummary {
    pub dispatched: usize,
    pub failed: usize,
}

impl EvaluationSummary {
    fn absorb(&mut self, other: EvaluationSummary) {
        self.dispatched += other.dispatched;
        self.failed += other.failed;
    }
}

/// Edge-triggered threshold evaluator. Every crossing is gated by a
/// persisted flag: dispatch happens only while the flag is unfired, and the
/// flag is written only after the transport accepted the message, so a
/// failed dispatch is retried on the next tick.
pub struct ReminderEngine {
    store: Arc<GarageStore>,
    notifier: Arc<dyn Notifier>,
}

impl ReminderEngine {
    pub fn new(store: Arc<GarageStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    pub async fn evaluate(&self, now: i64) -> Result<EvaluationSummary> {
        let mut summary = EvaluationSummary::default();
        summary.absorb(self.evaluate_service(now).await?);
        summary.absorb(self.evaluate_insurance(now).await?);
        summary.absorb(self.evaluate_recurring(now).await?);
        Ok(summary)
    }

    /// Vehicle service thresholds: distance and time are tracked
    /// independently, each with its own flag.
    pub async fn evaluate_service(&self, now: i64) -> Result<EvaluationSummary> {
        let mut summary = EvaluationSummary::default();
        for vehicle in self.store.all_active_vehicles().await? {
            if let (Some(base), Some(interval)) =
                (vehicle.last_service_odometer, vehicle.service_interval_km)
            {
                if interval > 0.0 && vehicle.odometer_km >= base + interval {
                    let text = format!(
                        "Service due for {}: {:.0} km on the clock, {:.0} km since the last service (interval {:.0} km).",
                        vehicle.label(),
                        vehicle.odometer_km,
                        vehicle.odometer_km - base,
                        interval
                    );
                    self.fire_once(
                        &vehicle.owner_id,
                        SubjectKind::Vehicle,
                        vehicle.id,
                        ThresholdKind::ServiceDistance,
                        &text,
                        now,
                        &mut summary,
                    )
                    .await?;
                }
            }

            if let (Some(base), Some(months)) =
                (vehicle.last_service_date, vehicle.service_interval_months)
            {
                if months > 0 && now >= base + months_to_seconds(months) {
                    let text = format!(
                        "Service due for {}: more than {months} months passed since the last service.",
                        vehicle.label()
                    );
                    self.fire_once(
                        &vehicle.owner_id,
                        SubjectKind::Vehicle,
                        vehicle.id,
                        ThresholdKind::ServiceDate,
                        &text,
                        now,
                        &mut summary,
                    )
                    .await?;
                }
            }
        }
        Ok(summary)
    }

    /// Insurance deadline bands, most specific first. At most one band
    /// fires per policy per tick; once a closer band has fired, the wider
    /// ones are never revisited for that policy.
    pub async fn evaluate_insurance(&self, now: i64) -> Result<EvaluationSummary> {
        let mut summary = EvaluationSummary::default();
        for vehicle in self.store.all_active_vehicles().await? {
            for policy in self.store.list_insurance(vehicle.id).await? {
                let days_left = days_between(now, policy.end_date);

                if days_left <= 0 {
                    let text = format!(
                        "The insurance policy for {} expired on {}.",
                        vehicle.label(),
                        crate::conversation::flow::epoch_to_date_label(policy.end_date)
                    );
                    self.fire_once(
                        &vehicle.owner_id,
                        SubjectKind::Policy,
                        policy.id,
                        ThresholdKind::Expired,
                        &text,
                        now,
                        &mut summary,
                    )
                    .await?;
                    continue;
                }
                if days_left <= 3 {
                    let text = renewal_text(&vehicle, &policy, days_left);
                    self.fire_once(
                        &vehicle.owner_id,
                        SubjectKind::Policy,
                        policy.id,
                        ThresholdKind::Renewal3d,
                        &text,
                        now,
                        &mut summary,
                    )
                    .await?;
                    continue;
                }
                if days_left <= 7 {
                    let text = renewal_text(&vehicle, &policy, days_left);
                    self.fire_once(
                        &vehicle.owner_id,
                        SubjectKind::Policy,
                        policy.id,
                        ThresholdKind::Renewal7d,
                        &text,
                        now,
                        &mut summary,
                    )
                    .await?;
                }
            }
        }
        Ok(summary)
    }

    /// Recurring part replacements: one flag per item, armed again by the
    /// next recorded replacement.
    pub async fn evaluate_recurring(&self, now: i64) -> Result<EvaluationSummary> {
        let mut summary = EvaluationSummary::default();
        for vehicle in self.store.all_active_vehicles().await? {
            for item in self.store.list_recurring_items(vehicle.id).await? {
                let reasons = due_reasons(&vehicle, &item, now);
                if reasons.is_empty() {
                    continue;
                }
                let text = format!(
                    "Time to replace '{}' on {}: {}.",
                    item.name,
                    vehicle.label(),
                    reasons.join(", ")
                );
                self.fire_once(
                    &vehicle.owner_id,
                    SubjectKind::RecurringItem,
                    item.id,
                    ThresholdKind::ItemDue,
                    &text,
                    now,
                    &mut summary,
                )
                .await?;
            }
        }
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fire_once(
        &self,
        chat_id: &str,
        subject: SubjectKind,
        subject_id: i32,
        kind: ThresholdKind,
        text: &str,
        now: i64,
        summary: &mut EvaluationSummary,
    ) -> Result<()> {
        if self.store.flag_fired(subject, subject_id, kind).await? {
            return Ok(());
        }
        match self.notifier.send(chat_id, text).await {
            Ok(()) => {
                self.store
                    .mark_flag_fired(subject, subject_id, kind, now)
                    .await?;
                summary.dispatched += 1;
                tracing::info!(
                    chat_id,
                    subject = subject.as_str(),
                    subject_id,
                    kind = kind.as_str(),
                    "reminder dispatched"
                );
            }
            Err(err) => {
                // flag stays unset so the next tick retries the dispatch
                summary.failed += 1;
                tracing::warn!(
                    chat_id,
                    subject = subject.as_str(),
                    subject_id,
                    kind = kind.as_str(),
                    "reminder dispatch failed: {err}"
                );
            }
        }
        Ok(())
    }
}

fn renewal_text(vehicle: &Vehicle, policy: &InsurancePolicy, days_left: i64) -> String {
    format!(
        "The insurance policy for {} ends in {days_left} day(s), on {}.",
        vehicle.label(),
        crate::conversation::flow::epoch_to_date_label(policy.end_date)
    )
}

/// Whole calendar days between two timestamps, by date, matching how a
/// person reads "days left" on a policy.
pub fn days_between(now: i64, later: i64) -> i64 {
    let now_date = chrono::DateTime::from_timestamp(now, 0)
        .map(|dt| dt.date_naive())
        .unwrap_or_default();
    let later_date = chrono::DateTime::from_timestamp(later, 0)
        .map(|dt| dt.date_naive())
        .unwrap_or_default();
    (later_date - now_date).num_days()
}

fn due_reasons(vehicle: &Vehicle, item: &RecurringItem, now: i64) -> Vec<String> {
    let mut reasons = Vec::new();
    if let (Some(base), Some(interval)) = (item.last_odometer, item.interval_km) {
        if interval > 0.0 && vehicle.odometer_km >= base + interval {
            reasons.push(format!("{:.0} km since the last replacement",
                vehicle.odometer_km - base));
        }
    }
    if let (Some(base), Some(months)) = (item.last_date, item.interval_months) {
        if months > 0 && now >= base + months_to_seconds(months) {
            reasons.push(format!("more than {months} months since the last replacement"));
        }
    }
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::error::GarageBotError;
    use crate::store::{NewVehicle, SERVICE_CATEGORY};

    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        async fn count(&self) -> usize {
            self.sent.lock().await.len()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .await
                .push((chat_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(&self, _chat_id: &str, _text: &str) -> Result<()> {
            Err(GarageBotError::Dispatch("transport down".to_string()))
        }
    }

    async fn temp_store() -> (tempfile::TempDir, Arc<GarageStore>) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("garage.db");
        let store = Arc::new(
            GarageStore::new(db_path.to_string_lossy())
                .await
                .expect("store"),
        );
        (dir, store)
    }

    async fn seed_vehicle(store: &GarageStore, odometer_km: f64) -> crate::store::Vehicle {
        store
            .create_vehicle(NewVehicle {
                owner_id: "u1",
                brand: "Toyota",
                model: "Camry",
                year: 2019,
                nickname: None,
                odometer_km,
                fuel_type: "petrol",
            })
            .await
            .expect("vehicle")
    }

    const NOW: i64 = 1_750_000_000;

    #[tokio::test]
    async fn service_distance_crossing_fires_exactly_once() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, 20_000.0).await;
        store
            .set_service_plan(vehicle.id, Some(10_000.0), None)
            .await
            .expect("plan");
        store
            .record_maintenance_event(
                vehicle.id,
                NOW - 90 * DAY_SECONDS,
                Some(10_000.0),
                4_000.0,
                "full service",
                SERVICE_CATEGORY,
            )
            .await
            .expect("service event");

        let notifier = RecordingNotifier::new();
        let engine = ReminderEngine::new(store.clone(), notifier.clone());

        let first = engine.evaluate_service(NOW).await.expect("evaluate");
        assert_eq!(first.dispatched, 1);
        assert_eq!(notifier.count().await, 1);

        let second = engine.evaluate_service(NOW).await.expect("evaluate again");
        assert_eq!(second.dispatched, 0);
        assert_eq!(notifier.count().await, 1);
    }

    #[tokio::test]
    async fn service_distance_boundary_is_inclusive() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, 19_999.0).await;
        store
            .set_service_plan(vehicle.id, Some(10_000.0), None)
            .await
            .expect("plan");
        store
            .record_maintenance_event(
                vehicle.id,
                NOW - DAY_SECONDS,
                Some(10_000.0),
                4_000.0,
                "full service",
                SERVICE_CATEGORY,
            )
            .await
            .expect("service event");

        let notifier = RecordingNotifier::new();
        let engine = ReminderEngine::new(store.clone(), notifier.clone());

        assert_eq!(
            engine.evaluate_service(NOW).await.expect("under").dispatched,
            0
        );

        store
            .update_odometer(vehicle.id, 20_000.0, false)
            .await
            .expect("odometer");
        assert_eq!(
            engine.evaluate_service(NOW).await.expect("exact").dispatched,
            1
        );
    }

    #[tokio::test]
    async fn service_flag_rearms_when_baseline_is_replaced() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, 20_000.0).await;
        store
            .set_service_plan(vehicle.id, Some(10_000.0), None)
            .await
            .expect("plan");
        store
            .record_maintenance_event(
                vehicle.id,
                NOW - 90 * DAY_SECONDS,
                Some(10_000.0),
                4_000.0,
                "full service",
                SERVICE_CATEGORY,
            )
            .await
            .expect("service event");

        let notifier = RecordingNotifier::new();
        let engine = ReminderEngine::new(store.clone(), notifier.clone());
        assert_eq!(engine.evaluate_service(NOW).await.expect("run").dispatched, 1);

        // new qualifying service replaces the baseline and re-arms the flag
        store
            .record_maintenance_event(
                vehicle.id,
                NOW,
                Some(20_000.0),
                4_500.0,
                "full service",
                SERVICE_CATEGORY,
            )
            .await
            .expect("next service");
        assert_eq!(engine.evaluate_service(NOW).await.expect("run").dispatched, 0);

        store
            .update_odometer(vehicle.id, 30_000.0, false)
            .await
            .expect("odometer");
        assert_eq!(engine.evaluate_service(NOW).await.expect("run").dispatched, 1);
    }

    #[tokio::test]
    async fn date_interval_uses_thirty_day_months() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, 20_000.0).await;
        store
            .set_service_plan(vehicle.id, None, Some(12))
            .await
            .expect("plan");
        store
            .record_maintenance_event(
                vehicle.id,
                NOW - 359 * DAY_SECONDS,
                None,
                4_000.0,
                "full service",
                SERVICE_CATEGORY,
            )
            .await
            .expect("service event");

        let notifier = RecordingNotifier::new();
        let engine = ReminderEngine::new(store.clone(), notifier.clone());
        assert_eq!(engine.evaluate_service(NOW).await.expect("early").dispatched, 0);
        assert_eq!(
            engine
                .evaluate_service(NOW + DAY_SECONDS)
                .await
                .expect("on time")
                .dispatched,
            1
        );
    }

    #[tokio::test]
    async fn insurance_fires_only_the_most_specific_band() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, 20_000.0).await;
        store
            .add_insurance(vehicle.id, NOW + 5 * DAY_SECONDS, 25_000.0, None, None, None)
            .await
            .expect("policy");

        let notifier = RecordingNotifier::new();
        let engine = ReminderEngine::new(store.clone(), notifier.clone());

        // five days out: only the 7-day band
        let run = engine.evaluate_insurance(NOW).await.expect("run");
        assert_eq!(run.dispatched, 1);
        let run = engine.evaluate_insurance(NOW).await.expect("rerun");
        assert_eq!(run.dispatched, 0);

        // two days out: the 3-day band fires its own flag
        let run = engine
            .evaluate_insurance(NOW + 3 * DAY_SECONDS)
            .await
            .expect("run");
        assert_eq!(run.dispatched, 1);

        // past the end date: expired
        let run = engine
            .evaluate_insurance(NOW + 6 * DAY_SECONDS)
            .await
            .expect("run");
        assert_eq!(run.dispatched, 1);

        // and nothing ever again for this policy
        let run = engine
            .evaluate_insurance(NOW + 30 * DAY_SECONDS)
            .await
            .expect("run");
        assert_eq!(run.dispatched, 0);
        assert_eq!(notifier.count().await, 3);
    }

    #[tokio::test]
    async fn insurance_jumping_straight_to_expired_fires_once() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, 20_000.0).await;
        store
            .add_insurance(vehicle.id, NOW - DAY_SECONDS, 25_000.0, None, None, None)
            .await
            .expect("policy");

        let notifier = RecordingNotifier::new();
        let engine = ReminderEngine::new(store.clone(), notifier.clone());

        assert_eq!(
            engine.evaluate_insurance(NOW).await.expect("run").dispatched,
            1
        );
        assert_eq!(
            engine
                .evaluate_insurance(NOW + DAY_SECONDS)
                .await
                .expect("run")
                .dispatched,
            0
        );
        assert_eq!(notifier.count().await, 1);
    }

    #[tokio::test]
    async fn recurring_item_is_due_by_distance() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, 71_000.0).await;
        store
            .upsert_recurring_item(
                vehicle.id,
                "brake pads",
                Some(40_000.0),
                None,
                Some(30_000.0),
                None,
            )
            .await
            .expect("item");

        let notifier = RecordingNotifier::new();
        let engine = ReminderEngine::new(store.clone(), notifier.clone());

        assert_eq!(
            engine.evaluate_recurring(NOW).await.expect("run").dispatched,
            1
        );
        assert_eq!(
            engine.evaluate_recurring(NOW).await.expect("rerun").dispatched,
            0
        );

        // recording the replacement re-arms the reminder
        store
            .upsert_recurring_item(
                vehicle.id,
                "brake pads",
                Some(71_000.0),
                Some(NOW),
                Some(30_000.0),
                None,
            )
            .await
            .expect("replace");
        assert_eq!(
            engine.evaluate_recurring(NOW).await.expect("rearmed").dispatched,
            0
        );
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_flag_unset_for_retry() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, 20_000.0).await;
        store
            .set_service_plan(vehicle.id, Some(10_000.0), None)
            .await
            .expect("plan");
        store
            .record_maintenance_event(
                vehicle.id,
                NOW - 90 * DAY_SECONDS,
                Some(10_000.0),
                4_000.0,
                "full service",
                SERVICE_CATEGORY,
            )
            .await
            .expect("service event");

        let broken = ReminderEngine::new(store.clone(), Arc::new(FailingNotifier));
        let run = broken.evaluate_service(NOW).await.expect("run");
        assert_eq!(run.dispatched, 0);
        assert_eq!(run.failed, 1);

        let notifier = RecordingNotifier::new();
        let healthy = ReminderEngine::new(store.clone(), notifier.clone());
        let run = healthy.evaluate_service(NOW).await.expect("retry");
        assert_eq!(run.dispatched, 1);
        assert_eq!(notifier.count().await, 1);
    }

    #[tokio::test]
    async fn inactive_vehicles_are_skipped() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, 20_000.0).await;
        store
            .set_service_plan(vehicle.id, Some(10_000.0), None)
            .await
            .expect("plan");
        store
            .record_maintenance_event(
                vehicle.id,
                NOW - 90 * DAY_SECONDS,
                Some(10_000.0),
                4_000.0,
                "full service",
                SERVICE_CATEGORY,
            )
            .await
            .expect("service event");
        store
            .deactivate_vehicle("u1", vehicle.id)
            .await
            .expect("deactivate");

        let notifier = RecordingNotifier::new();
        let engine = ReminderEngine::new(store.clone(), notifier.clone());
        assert_eq!(engine.evaluate(NOW).await.expect("run").dispatched, 0);
    }
}
