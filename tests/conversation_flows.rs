use std::sync::Arc;

use tempfile::tempdir;

use garage_bot::config::Config;
use garage_bot::conversation::{Committed, ConversationEngine, FlowKind, SubmitOutcome, UserInput};
use garage_bot::interfaces::notifier::NoopNotifier;
use garage_bot::store::{GarageStore, NewVehicle};

async fn engine_with_store() -> (tempfile::TempDir, Arc<GarageStore>, ConversationEngine) {
    let dir = tempdir().expect("temp dir");
    let db_path = dir.path().join("garage.db");
    let store = Arc::new(
        GarageStore::new(db_path.to_string_lossy())
            .await
            .expect("store"),
    );
    let engine = ConversationEngine::new(
        store.clone(),
        Arc::new(Config::convention_defaults()),
        Arc::new(NoopNotifier),
    );
    (dir, store, engine)
}

async fn seed_vehicle(store: &GarageStore, owner: &str, odometer_km: f64) -> garage_bot::store::Vehicle {
    store
        .create_vehicle(NewVehicle {
            owner_id: owner,
            brand: "Lada",
            model: "Vesta",
            year: 2022,
            nickname: None,
            odometer_km,
            fuel_type: "petrol",
        })
        .await
        .expect("vehicle")
}

async fn submit(engine: &ConversationEngine, user: &str, raw: &str) -> SubmitOutcome {
    engine
        .submit(user, UserInput::from_raw(raw))
        .await
        .expect("submit")
}

#[tokio::test]
async fn cancelling_midway_leaves_the_store_unchanged() {
    let (_dir, store, engine) = engine_with_store().await;

    engine
        .start(FlowKind::RegisterVehicle, "u1")
        .await
        .expect("start");
    submit(&engine, "u1", "cb:brand::Lada").await;
    submit(&engine, "u1", "cb:model:Lada:Vesta").await;
    submit(&engine, "u1", "2022").await;

    let outcome = submit(&engine, "u1", "/cancel").await;
    assert!(matches!(outcome, SubmitOutcome::Cancelled(_)));

    assert!(store.list_vehicles("u1").await.expect("list").is_empty());
    assert!(!engine.has_active_session("u1").await);
}

#[tokio::test]
async fn rejected_input_reprompts_and_stays_in_place() {
    let (_dir, store, engine) = engine_with_store().await;

    engine
        .start(FlowKind::RegisterVehicle, "u1")
        .await
        .expect("start");
    submit(&engine, "u1", "cb:brand::Lada").await;
    submit(&engine, "u1", "cb:model:Lada:Vesta").await;

    for bad in ["soon", "1850", "2150"] {
        let outcome = submit(&engine, "u1", bad).await;
        assert!(matches!(outcome, SubmitOutcome::Reprompt(_)), "input {bad:?}");
    }

    // the state did not advance: a valid year is still accepted here
    let outcome = submit(&engine, "u1", "2022").await;
    assert!(matches!(outcome, SubmitOutcome::Advance(_)));
    assert!(store.list_vehicles("u1").await.expect("list").is_empty());
}

#[tokio::test]
async fn vehicle_vanishing_before_confirm_aborts_without_a_write() {
    let (_dir, store, engine) = engine_with_store().await;
    let vehicle = seed_vehicle(&store, "u1", 30_000.0).await;

    engine
        .start(FlowKind::AddInsurance, "u1")
        .await
        .expect("start");
    submit(&engine, "u1", "31.12.2099").await;
    submit(&engine, "u1", "20000").await;
    submit(&engine, "u1", "-").await;
    submit(&engine, "u1", "-").await;
    submit(&engine, "u1", "-").await;

    store
        .deactivate_vehicle("u1", vehicle.id)
        .await
        .expect("deactivate");

    let outcome = submit(&engine, "u1", "yes").await;
    match outcome {
        SubmitOutcome::Cancelled(message) => {
            assert!(message.contains("no longer exists"));
        }
        other => panic!("expected not-found termination, got {other:?}"),
    }
    assert!(store
        .list_insurance(vehicle.id)
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn parts_flow_records_event_then_upserts_the_item() {
    let (_dir, store, engine) = engine_with_store().await;
    let vehicle = seed_vehicle(&store, "u1", 70_000.0).await;

    engine
        .start(FlowKind::LogMaintenance, "u1")
        .await
        .expect("start");
    submit(&engine, "u1", "cb:cat::parts").await;
    submit(&engine, "u1", "brake pads").await;
    submit(&engine, "u1", "1200").await;
    submit(&engine, "u1", "70000").await;

    // confirmation commits the event and branches into interval questions
    let outcome = submit(&engine, "u1", "yes").await;
    assert!(matches!(outcome, SubmitOutcome::Advance(_)));
    assert_eq!(
        store
            .list_maintenance_events(vehicle.id, 0)
            .await
            .expect("events")
            .len(),
        1
    );

    submit(&engine, "u1", "30000").await;
    let outcome = submit(&engine, "u1", "24").await;
    let item = match outcome {
        SubmitOutcome::Complete {
            entity: Committed::RecurringItem(item),
            ..
        } => item,
        other => panic!("expected recurring item, got {other:?}"),
    };
    assert_eq!(item.name, "brake pads");
    assert_eq!(item.last_odometer, Some(70_000.0));
    assert_eq!(item.interval_km, Some(30_000.0));
    assert_eq!(item.interval_months, Some(24));
}

#[tokio::test]
async fn zero_intervals_leave_the_item_without_reminders() {
    let (_dir, store, engine) = engine_with_store().await;
    let vehicle = seed_vehicle(&store, "u1", 70_000.0).await;

    engine
        .start(FlowKind::LogMaintenance, "u1")
        .await
        .expect("start");
    submit(&engine, "u1", "cb:cat::parts").await;
    submit(&engine, "u1", "cabin filter").await;
    submit(&engine, "u1", "500").await;
    submit(&engine, "u1", "-").await;
    submit(&engine, "u1", "yes").await;
    submit(&engine, "u1", "0").await;
    let outcome = submit(&engine, "u1", "0").await;

    let item = match outcome {
        SubmitOutcome::Complete {
            entity: Committed::RecurringItem(item),
            ..
        } => item,
        other => panic!("expected recurring item, got {other:?}"),
    };
    assert_eq!(item.interval_km, None);
    assert_eq!(item.interval_months, None);

    let items = store
        .list_recurring_items(vehicle.id)
        .await
        .expect("items");
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn service_maintenance_resets_baseline_through_the_flow() {
    let (_dir, store, engine) = engine_with_store().await;
    let vehicle = seed_vehicle(&store, "u1", 60_000.0).await;

    engine
        .start(FlowKind::LogMaintenance, "u1")
        .await
        .expect("start");
    submit(&engine, "u1", "cb:cat::service").await;
    submit(&engine, "u1", "oil, filters, plugs").await;
    submit(&engine, "u1", "7000").await;
    submit(&engine, "u1", "60000").await;
    let outcome = submit(&engine, "u1", "yes").await;
    assert!(matches!(
        outcome,
        SubmitOutcome::Complete {
            entity: Committed::Maintenance(_),
            ..
        }
    ));

    let after = store
        .get_vehicle(vehicle.id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(after.last_service_odometer, Some(60_000.0));
    assert!(after.last_service_date.is_some());
}

#[tokio::test]
async fn odometer_override_path_lowers_the_reading() {
    let (_dir, store, engine) = engine_with_store().await;
    let vehicle = seed_vehicle(&store, "u1", 51_000.0).await;

    engine
        .start(FlowKind::UpdateOdometer, "u1")
        .await
        .expect("start");
    let outcome = submit(&engine, "u1", "50500").await;
    match outcome {
        SubmitOutcome::Advance(prompt) => assert!(prompt.contains("below")),
        other => panic!("expected decrease confirmation, got {other:?}"),
    }

    let outcome = submit(&engine, "u1", "yes").await;
    assert!(matches!(
        outcome,
        SubmitOutcome::Complete {
            entity: Committed::OdometerUpdated { .. },
            ..
        }
    ));

    let after = store
        .get_vehicle(vehicle.id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(after.odometer_km, 50_500.0);
}

#[tokio::test]
async fn delete_flow_soft_deletes_after_confirmation() {
    let (_dir, store, engine) = engine_with_store().await;
    let vehicle = seed_vehicle(&store, "u1", 30_000.0).await;

    engine
        .start(FlowKind::DeleteVehicle, "u1")
        .await
        .expect("start");
    let outcome = submit(&engine, "u1", "yes").await;
    assert!(matches!(
        outcome,
        SubmitOutcome::Complete {
            entity: Committed::VehicleDeactivated { .. },
            ..
        }
    ));

    assert!(store.list_vehicles("u1").await.expect("list").is_empty());
    let kept = store
        .get_vehicle(vehicle.id)
        .await
        .expect("get")
        .expect("row");
    assert!(!kept.active);
}
