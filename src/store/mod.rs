use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use diesel::dsl::sum;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use serde::Serialize;

use crate::error::{GarageBotError, Result};

mod schema;
use schema::{
    fuel_events, insurance_policies, maintenance_events, recurring_items, threshold_flags,
    vehicles,
};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

type SqliteAsyncConn = SyncConnectionWrapper<SqliteConnection>;
type SqlitePool = Pool<SqliteAsyncConn>;
type SqlitePooledConn<'a> = PooledConnection<'a, SqliteAsyncConn>;

/// Maintenance category whose confirmation also moves the vehicle's
/// service baseline and re-arms both service reminder thresholds.
pub const SERVICE_CATEGORY: &str = "service";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    Vehicle,
    RecurringItem,
    Policy,
}

impl SubjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectKind::Vehicle => "vehicle",
            SubjectKind::RecurringItem => "item",
            SubjectKind::Policy => "policy",
        }
    }
}

/// One monitored crossing per (subject, kind) pair. Fired state is a row in
/// `threshold_flags` carrying the dispatch timestamp; absence means unfired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    ServiceDistance,
    ServiceDate,
    ItemDue,
    Renewal7d,
    Renewal3d,
    Expired,
}

impl ThresholdKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdKind::ServiceDistance => "service_distance",
            ThresholdKind::ServiceDate => "service_date",
            ThresholdKind::ItemDue => "item_due",
            ThresholdKind::Renewal7d => "renewal_7d",
            ThresholdKind::Renewal3d => "renewal_3d",
            ThresholdKind::Expired => "expired",
        }
    }

    pub fn subject(self) -> SubjectKind {
        match self {
            ThresholdKind::ServiceDistance | ThresholdKind::ServiceDate => SubjectKind::Vehicle,
            ThresholdKind::ItemDue => SubjectKind::RecurringItem,
            ThresholdKind::Renewal7d | ThresholdKind::Renewal3d | ThresholdKind::Expired => {
                SubjectKind::Policy
            }
        }
    }
}

pub const SERVICE_FLAGS: [ThresholdKind; 2] =
    [ThresholdKind::ServiceDistance, ThresholdKind::ServiceDate];

#[derive(Debug, Clone, Serialize)]
pub struct Vehicle {
    pub id: i32,
    pub owner_id: String,
    pub brand: String,
    pub model: String,
    pub year: i32,
    pub nickname: Option<String>,
    pub odometer_km: f64,
    pub fuel_type: String,
    pub active: bool,
    pub created_at: i64,
    pub last_service_odometer: Option<f64>,
    pub last_service_date: Option<i64>,
    pub service_interval_km: Option<f64>,
    pub service_interval_months: Option<i32>,
}

impl Vehicle {
    pub fn label(&self) -> String {
        match &self.nickname {
            Some(nickname) => format!("{} {} ({nickname})", self.brand, self.model),
            None => format!("{} {} ({})", self.brand, self.model, self.year),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecurringItem {
    pub id: i32,
    pub vehicle_id: i32,
    pub name: String,
    pub last_odometer: Option<f64>,
    pub last_date: Option<i64>,
    pub interval_km: Option<f64>,
    pub interval_months: Option<i32>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InsurancePolicy {
    pub id: i32,
    pub vehicle_id: i32,
    pub end_date: i64,
    pub cost: f64,
    pub policy_number: Option<String>,
    pub company: Option<String>,
    pub notes: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FuelEvent {
    pub id: i32,
    pub vehicle_id: i32,
    pub occurred_at: i64,
    pub odometer_km: Option<f64>,
    pub liters: f64,
    pub cost: f64,
    pub fuel_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceEvent {
    pub id: i32,
    pub vehicle_id: i32,
    pub occurred_at: i64,
    pub odometer_km: Option<f64>,
    pub cost: f64,
    pub description: String,
    pub category: String,
}

/// Outcome of the normal odometer update path. Decreases are refused here;
/// only the override path passes `allow_decrease`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OdometerUpdate {
    Updated { from: f64, to: f64 },
    RejectedDecrease { current: f64 },
}

#[derive(Debug, Clone)]
pub struct NewVehicle<'a> {
    pub owner_id: &'a str,
    pub brand: &'a str,
    pub model: &'a str,
    pub year: i32,
    pub nickname: Option<&'a str>,
    pub odometer_km: f64,
    pub fuel_type: &'a str,
}

#[derive(Queryable)]
struct VehicleRow {
    id: i32,
    owner_id: String,
    brand: String,
    model: String,
    year: i32,
    nickname: Option<String>,
    odometer_km: f64,
    fuel_type: String,
    active: bool,
    created_at: i64,
    last_service_odometer: Option<f64>,
    last_service_date: Option<i64>,
    service_interval_km: Option<f64>,
    service_interval_months: Option<i32>,
}

#[derive(Insertable)]
#[diesel(table_name = vehicles)]
struct VehicleInsert<'a> {
    owner_id: &'a str,
    brand: &'a str,
    model: &'a str,
    year: i32,
    nickname: Option<&'a str>,
    odometer_km: f64,
    fuel_type: &'a str,
    active: bool,
    created_at: i64,
}

#[derive(Queryable)]
struct RecurringItemRow {
    id: i32,
    vehicle_id: i32,
    name: String,
    last_odometer: Option<f64>,
    last_date: Option<i64>,
    interval_km: Option<f64>,
    interval_months: Option<i32>,
    created_at: i64,
    updated_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = recurring_items)]
struct RecurringItemInsert<'a> {
    vehicle_id: i32,
    name: &'a str,
    last_odometer: Option<f64>,
    last_date: Option<i64>,
    interval_km: Option<f64>,
    interval_months: Option<i32>,
    created_at: i64,
    updated_at: i64,
}

#[derive(Queryable)]
struct InsurancePolicyRow {
    id: i32,
    vehicle_id: i32,
    end_date: i64,
    cost: f64,
    policy_number: Option<String>,
    company: Option<String>,
    notes: Option<String>,
    created_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = insurance_policies)]
struct InsurancePolicyInsert<'a> {
    vehicle_id: i32,
    end_date: i64,
    cost: f64,
    policy_number: Option<&'a str>,
    company: Option<&'a str>,
    notes: Option<&'a str>,
    created_at: i64,
}

#[derive(Queryable)]
struct FuelEventRow {
    id: i32,
    vehicle_id: i32,
    occurred_at: i64,
    odometer_km: Option<f64>,
    liters: f64,
    cost: f64,
    fuel_type: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = fuel_events)]
struct FuelEventInsert<'a> {
    vehicle_id: i32,
    occurred_at: i64,
    odometer_km: Option<f64>,
    liters: f64,
    cost: f64,
    fuel_type: Option<&'a str>,
}

#[derive(Queryable)]
struct MaintenanceEventRow {
    id: i32,
    vehicle_id: i32,
    occurred_at: i64,
    odometer_km: Option<f64>,
    cost: f64,
    description: String,
    category: String,
}

#[derive(Insertable)]
#[diesel(table_name = maintenance_events)]
struct MaintenanceEventInsert<'a> {
    vehicle_id: i32,
    occurred_at: i64,
    odometer_km: Option<f64>,
    cost: f64,
    description: &'a str,
    category: &'a str,
}

#[derive(Insertable)]
#[diesel(table_name = threshold_flags)]
struct ThresholdFlagInsert<'a> {
    subject_kind: &'a str,
    subject_id: i32,
    kind: &'a str,
    fired_at: i64,
}

pub struct GarageStore {
    pool: SqlitePool,
}

impl GarageStore {
    pub async fn new(sqlite_path: impl AsRef<str>) -> Result<Self> {
        let sqlite_path = sqlite_path.as_ref();
        ensure_parent_dir(sqlite_path)?;
        run_migrations(sqlite_path).await?;

        let manager = AsyncDieselConnectionManager::<SqliteAsyncConn>::new(sqlite_path);
        let pool: SqlitePool = Pool::builder()
            .build(manager)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn create_vehicle(&self, new: NewVehicle<'_>) -> Result<Vehicle> {
        let now = now_ts();
        let mut conn = self.conn().await?;
        let insert = VehicleInsert {
            owner_id: new.owner_id,
            brand: new.brand,
            model: new.model,
            year: new.year,
            nickname: new.nickname,
            odometer_km: new.odometer_km,
            fuel_type: new.fuel_type,
            active: true,
            created_at: now,
        };
        diesel::insert_into(vehicles::table)
            .values(&insert)
            .execute(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;

        let row: VehicleRow = vehicles::table
            .filter(vehicles::owner_id.eq(new.owner_id))
            .order(vehicles::id.desc())
            .first(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(map_vehicle(row))
    }

    pub async fn list_vehicles(&self, owner_id: &str) -> Result<Vec<Vehicle>> {
        let mut conn = self.conn().await?;
        let rows: Vec<VehicleRow> = vehicles::table
            .filter(vehicles::owner_id.eq(owner_id))
            .filter(vehicles::active.eq(true))
            .order(vehicles::id.asc())
            .load(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(rows.into_iter().map(map_vehicle).collect())
    }

    pub async fn all_active_vehicles(&self) -> Result<Vec<Vehicle>> {
        let mut conn = self.conn().await?;
        let rows: Vec<VehicleRow> = vehicles::table
            .filter(vehicles::active.eq(true))
            .order(vehicles::id.asc())
            .load(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(rows.into_iter().map(map_vehicle).collect())
    }

    pub async fn get_vehicle(&self, id: i32) -> Result<Option<Vehicle>> {
        let mut conn = self.conn().await?;
        let row = vehicles::table
            .filter(vehicles::id.eq(id))
            .first::<VehicleRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(row.map(map_vehicle))
    }

    pub async fn get_owned_vehicle(&self, owner_id: &str, id: i32) -> Result<Option<Vehicle>> {
        let mut conn = self.conn().await?;
        let row = vehicles::table
            .filter(vehicles::id.eq(id))
            .filter(vehicles::owner_id.eq(owner_id))
            .filter(vehicles::active.eq(true))
            .first::<VehicleRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(row.map(map_vehicle))
    }

    /// Normal odometer path. A reading below the stored value is refused and
    /// reported back so the caller can route through the override
    /// confirmation; `allow_decrease` is that override.
    pub async fn update_odometer(
        &self,
        id: i32,
        new_km: f64,
        allow_decrease: bool,
    ) -> Result<OdometerUpdate> {
        let mut conn = self.conn().await?;
        let row: VehicleRow = vehicles::table
            .filter(vehicles::id.eq(id))
            .first(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        let current = row.odometer_km;

        if new_km < current && !allow_decrease {
            return Ok(OdometerUpdate::RejectedDecrease { current });
        }

        diesel::update(vehicles::table.filter(vehicles::id.eq(id)))
            .set(vehicles::odometer_km.eq(new_km))
            .execute(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(OdometerUpdate::Updated {
            from: current,
            to: new_km,
        })
    }

    pub async fn deactivate_vehicle(&self, owner_id: &str, id: i32) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            vehicles::table
                .filter(vehicles::id.eq(id))
                .filter(vehicles::owner_id.eq(owner_id)),
        )
        .set(vehicles::active.eq(false))
        .execute(&mut conn)
        .await
        .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(updated > 0)
    }

    /// Stores the service reminder plan and re-arms both service thresholds
    /// in the same transaction. A `None` interval disables that trigger.
    pub async fn set_service_plan(
        &self,
        vehicle_id: i32,
        interval_km: Option<f64>,
        interval_months: Option<i32>,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            async move {
                diesel::update(vehicles::table.filter(vehicles::id.eq(vehicle_id)))
                    .set((
                        vehicles::service_interval_km.eq(interval_km),
                        vehicles::service_interval_months.eq(interval_months),
                    ))
                    .execute(conn)
                    .await?;
                clear_flags_in(conn, SubjectKind::Vehicle, vehicle_id, &SERVICE_FLAGS).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(|e| GarageBotError::Storage(e.to_string()))
    }

    /// Inserts the fuel event and, when the event carries a higher reading,
    /// advances the vehicle odometer. A lower reading is kept on the event
    /// verbatim and never pulls the vehicle backwards.
    pub async fn record_fuel_event(
        &self,
        vehicle_id: i32,
        occurred_at: i64,
        odometer_km: Option<f64>,
        liters: f64,
        cost: f64,
        fuel_type: Option<&str>,
    ) -> Result<FuelEvent> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            async move {
                let insert = FuelEventInsert {
                    vehicle_id,
                    occurred_at,
                    odometer_km,
                    liters,
                    cost,
                    fuel_type,
                };
                diesel::insert_into(fuel_events::table)
                    .values(&insert)
                    .execute(conn)
                    .await?;
                if let Some(km) = odometer_km {
                    raise_odometer_in(conn, vehicle_id, km).await?;
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(|e| GarageBotError::Storage(e.to_string()))?;

        let row: FuelEventRow = fuel_events::table
            .filter(fuel_events::vehicle_id.eq(vehicle_id))
            .order(fuel_events::id.desc())
            .first(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(map_fuel_event(row))
    }

    /// Inserts the maintenance event; a `service`-category event also moves
    /// the vehicle's service baseline to the event odometer/date and clears
    /// both service flags. Everything commits as one transaction.
    pub async fn record_maintenance_event(
        &self,
        vehicle_id: i32,
        occurred_at: i64,
        odometer_km: Option<f64>,
        cost: f64,
        description: &str,
        category: &str,
    ) -> Result<MaintenanceEvent> {
        let mut conn = self.conn().await?;
        let is_service = category == SERVICE_CATEGORY;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            async move {
                let insert = MaintenanceEventInsert {
                    vehicle_id,
                    occurred_at,
                    odometer_km,
                    cost,
                    description,
                    category,
                };
                diesel::insert_into(maintenance_events::table)
                    .values(&insert)
                    .execute(conn)
                    .await?;
                if let Some(km) = odometer_km {
                    raise_odometer_in(conn, vehicle_id, km).await?;
                }
                if is_service {
                    let baseline_km = match odometer_km {
                        Some(km) => Some(km),
                        None => vehicles::table
                            .filter(vehicles::id.eq(vehicle_id))
                            .select(vehicles::odometer_km)
                            .first::<f64>(conn)
                            .await
                            .optional()?,
                    };
                    diesel::update(vehicles::table.filter(vehicles::id.eq(vehicle_id)))
                        .set((
                            vehicles::last_service_odometer.eq(baseline_km),
                            vehicles::last_service_date.eq(Some(occurred_at)),
                        ))
                        .execute(conn)
                        .await?;
                    clear_flags_in(conn, SubjectKind::Vehicle, vehicle_id, &SERVICE_FLAGS).await?;
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(|e| GarageBotError::Storage(e.to_string()))?;

        let row: MaintenanceEventRow = maintenance_events::table
            .filter(maintenance_events::vehicle_id.eq(vehicle_id))
            .order(maintenance_events::id.desc())
            .first(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(map_maintenance_event(row))
    }

    pub async fn add_insurance(
        &self,
        vehicle_id: i32,
        end_date: i64,
        cost: f64,
        policy_number: Option<&str>,
        company: Option<&str>,
        notes: Option<&str>,
    ) -> Result<InsurancePolicy> {
        let now = now_ts();
        let mut conn = self.conn().await?;
        let insert = InsurancePolicyInsert {
            vehicle_id,
            end_date,
            cost,
            policy_number,
            company,
            notes,
            created_at: now,
        };
        diesel::insert_into(insurance_policies::table)
            .values(&insert)
            .execute(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;

        let row: InsurancePolicyRow = insurance_policies::table
            .filter(insurance_policies::vehicle_id.eq(vehicle_id))
            .order(insurance_policies::id.desc())
            .first(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(map_policy(row))
    }

    pub async fn list_insurance(&self, vehicle_id: i32) -> Result<Vec<InsurancePolicy>> {
        let mut conn = self.conn().await?;
        let rows: Vec<InsurancePolicyRow> = insurance_policies::table
            .filter(insurance_policies::vehicle_id.eq(vehicle_id))
            .order(insurance_policies::end_date.desc())
            .load(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(rows.into_iter().map(map_policy).collect())
    }

    /// Creates or updates the item matched by (vehicle, name); the update
    /// path replaces last-values and intervals and re-arms the item's
    /// threshold, all in one transaction.
    pub async fn upsert_recurring_item(
        &self,
        vehicle_id: i32,
        name: &str,
        last_odometer: Option<f64>,
        last_date: Option<i64>,
        interval_km: Option<f64>,
        interval_months: Option<i32>,
    ) -> Result<RecurringItem> {
        let now = now_ts();
        let mut conn = self.conn().await?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            async move {
                let existing: Option<RecurringItemRow> = recurring_items::table
                    .filter(recurring_items::vehicle_id.eq(vehicle_id))
                    .filter(recurring_items::name.eq(name))
                    .first(conn)
                    .await
                    .optional()?;

                match existing {
                    Some(row) => {
                        diesel::update(
                            recurring_items::table.filter(recurring_items::id.eq(row.id)),
                        )
                        .set((
                            recurring_items::last_odometer.eq(last_odometer),
                            recurring_items::last_date.eq(last_date),
                            recurring_items::interval_km.eq(interval_km),
                            recurring_items::interval_months.eq(interval_months),
                            recurring_items::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;
                        clear_flags_in(
                            conn,
                            SubjectKind::RecurringItem,
                            row.id,
                            &[ThresholdKind::ItemDue],
                        )
                        .await?;
                    }
                    None => {
                        let insert = RecurringItemInsert {
                            vehicle_id,
                            name,
                            last_odometer,
                            last_date,
                            interval_km,
                            interval_months,
                            created_at: now,
                            updated_at: now,
                        };
                        diesel::insert_into(recurring_items::table)
                            .values(&insert)
                            .execute(conn)
                            .await?;
                    }
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(|e| GarageBotError::Storage(e.to_string()))?;

        let row: RecurringItemRow = recurring_items::table
            .filter(recurring_items::vehicle_id.eq(vehicle_id))
            .filter(recurring_items::name.eq(name))
            .first(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(map_item(row))
    }

    pub async fn list_recurring_items(&self, vehicle_id: i32) -> Result<Vec<RecurringItem>> {
        let mut conn = self.conn().await?;
        let rows: Vec<RecurringItemRow> = recurring_items::table
            .filter(recurring_items::vehicle_id.eq(vehicle_id))
            .order(recurring_items::name.asc())
            .load(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(rows.into_iter().map(map_item).collect())
    }

    pub async fn list_fuel_events(&self, vehicle_id: i32, limit: usize) -> Result<Vec<FuelEvent>> {
        let mut conn = self.conn().await?;
        let mut query = fuel_events::table
            .filter(fuel_events::vehicle_id.eq(vehicle_id))
            .into_boxed();
        if limit > 0 {
            query = query.limit(limit as i64);
        }
        let rows: Vec<FuelEventRow> = query
            .order(fuel_events::occurred_at.desc())
            .load(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(rows.into_iter().map(map_fuel_event).collect())
    }

    pub async fn list_maintenance_events(
        &self,
        vehicle_id: i32,
        limit: usize,
    ) -> Result<Vec<MaintenanceEvent>> {
        let mut conn = self.conn().await?;
        let mut query = maintenance_events::table
            .filter(maintenance_events::vehicle_id.eq(vehicle_id))
            .into_boxed();
        if limit > 0 {
            query = query.limit(limit as i64);
        }
        let rows: Vec<MaintenanceEventRow> = query
            .order(maintenance_events::occurred_at.desc())
            .load(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(rows.into_iter().map(map_maintenance_event).collect())
    }

    pub async fn fuel_cost_total(&self, vehicle_id: i32) -> Result<f64> {
        let mut conn = self.conn().await?;
        let total: Option<f64> = fuel_events::table
            .filter(fuel_events::vehicle_id.eq(vehicle_id))
            .select(sum(fuel_events::cost))
            .first(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(total.unwrap_or(0.0))
    }

    pub async fn maintenance_cost_total(&self, vehicle_id: i32) -> Result<f64> {
        let mut conn = self.conn().await?;
        let total: Option<f64> = maintenance_events::table
            .filter(maintenance_events::vehicle_id.eq(vehicle_id))
            .select(sum(maintenance_events::cost))
            .first(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(total.unwrap_or(0.0))
    }

    pub async fn flag_fired(
        &self,
        subject: SubjectKind,
        subject_id: i32,
        kind: ThresholdKind,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let found: Option<i32> = threshold_flags::table
            .filter(threshold_flags::subject_kind.eq(subject.as_str()))
            .filter(threshold_flags::subject_id.eq(subject_id))
            .filter(threshold_flags::kind.eq(kind.as_str()))
            .select(threshold_flags::id)
            .first(&mut conn)
            .await
            .optional()
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(found.is_some())
    }

    /// Idempotent: re-marking an already fired flag keeps the original
    /// fired_at timestamp.
    pub async fn mark_flag_fired(
        &self,
        subject: SubjectKind,
        subject_id: i32,
        kind: ThresholdKind,
        fired_at: i64,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        let insert = ThresholdFlagInsert {
            subject_kind: subject.as_str(),
            subject_id,
            kind: kind.as_str(),
            fired_at,
        };
        diesel::insert_or_ignore_into(threshold_flags::table)
            .values(&insert)
            .execute(&mut conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn clear_flags(
        &self,
        subject: SubjectKind,
        subject_id: i32,
        kinds: &[ThresholdKind],
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        clear_flags_in(&mut conn, subject, subject_id, kinds)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))
    }

    async fn conn(&self) -> Result<SqlitePooledConn<'_>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        crate::db::apply_connection_pragmas_async(&mut conn).await?;
        Ok(conn)
    }
}

async fn raise_odometer_in(
    conn: &mut SqliteAsyncConn,
    vehicle_id: i32,
    km: f64,
) -> std::result::Result<(), diesel::result::Error> {
    diesel::update(
        vehicles::table
            .filter(vehicles::id.eq(vehicle_id))
            .filter(vehicles::odometer_km.lt(km)),
    )
    .set(vehicles::odometer_km.eq(km))
    .execute(conn)
    .await?;
    Ok(())
}

async fn clear_flags_in(
    conn: &mut SqliteAsyncConn,
    subject: SubjectKind,
    subject_id: i32,
    kinds: &[ThresholdKind],
) -> std::result::Result<(), diesel::result::Error> {
    let kind_names: Vec<&str> = kinds.iter().map(|kind| kind.as_str()).collect();
    diesel::delete(
        threshold_flags::table
            .filter(threshold_flags::subject_kind.eq(subject.as_str()))
            .filter(threshold_flags::subject_id.eq(subject_id))
            .filter(threshold_flags::kind.eq_any(kind_names)),
    )
    .execute(conn)
    .await?;
    Ok(())
}

fn map_vehicle(row: VehicleRow) -> Vehicle {
    Vehicle {
        id: row.id,
        owner_id: row.owner_id,
        brand: row.brand,
        model: row.model,
        year: row.year,
        nickname: row.nickname,
        odometer_km: row.odometer_km,
        fuel_type: row.fuel_type,
        active: row.active,
        created_at: row.created_at,
        last_service_odometer: row.last_service_odometer,
        last_service_date: row.last_service_date,
        service_interval_km: row.service_interval_km,
        service_interval_months: row.service_interval_months,
    }
}

fn map_item(row: RecurringItemRow) -> RecurringItem {
    RecurringItem {
        id: row.id,
        vehicle_id: row.vehicle_id,
        name: row.name,
        last_odometer: row.last_odometer,
        last_date: row.last_date,
        interval_km: row.interval_km,
        interval_months: row.interval_months,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

fn map_policy(row: InsurancePolicyRow) -> InsurancePolicy {
    InsurancePolicy {
        id: row.id,
        vehicle_id: row.vehicle_id,
        end_date: row.end_date,
        cost: row.cost,
        policy_number: row.policy_number,
        company: row.company,
        notes: row.notes,
        created_at: row.created_at,
    }
}

fn map_fuel_event(row: FuelEventRow) -> FuelEvent {
    FuelEvent {
        id: row.id,
        vehicle_id: row.vehicle_id,
        occurred_at: row.occurred_at,
        odometer_km: row.odometer_km,
        liters: row.liters,
        cost: row.cost,
        fuel_type: row.fuel_type,
    }
}

fn map_maintenance_event(row: MaintenanceEventRow) -> MaintenanceEvent {
    MaintenanceEvent {
        id: row.id,
        vehicle_id: row.vehicle_id,
        occurred_at: row.occurred_at,
        odometer_km: row.odometer_km,
        cost: row.cost,
        description: row.description,
        category: row.category,
    }
}

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GarageBotError::Storage(e.to_string()))?;
    }
    Ok(())
}

async fn run_migrations(database_url: &str) -> Result<()> {
    let database_url = database_url.to_string();
    tokio::task::spawn_blocking(move || {
        let mut conn = crate::db::open_connection_sync(&database_url)?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
        Ok::<_, GarageBotError>(())
    })
    .await
    .map_err(|e| GarageBotError::Runtime(e.to_string()))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, GarageStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("garage.db");
        let store = GarageStore::new(db_path.to_string_lossy())
            .await
            .expect("store");
        (dir, store)
    }

    async fn seed_vehicle(store: &GarageStore, owner: &str) -> Vehicle {
        store
            .create_vehicle(NewVehicle {
                owner_id: owner,
                brand: "Toyota",
                model: "Camry",
                year: 2019,
                nickname: None,
                odometer_km: 51_000.0,
                fuel_type: "petrol",
            })
            .await
            .expect("create vehicle")
    }

    #[tokio::test]
    async fn create_and_list_scopes_by_owner_and_active() {
        let (_dir, store) = temp_store().await;
        let mine = seed_vehicle(&store, "u1").await;
        seed_vehicle(&store, "u2").await;

        let listed = store.list_vehicles("u1").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, mine.id);

        assert!(store.deactivate_vehicle("u1", mine.id).await.expect("drop"));
        assert!(store.list_vehicles("u1").await.expect("list").is_empty());

        // soft delete keeps the row reachable by id
        let kept = store.get_vehicle(mine.id).await.expect("get").expect("row");
        assert!(!kept.active);
    }

    #[tokio::test]
    async fn odometer_decrease_needs_override() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, "u1").await;

        let refused = store
            .update_odometer(vehicle.id, 50_500.0, false)
            .await
            .expect("update");
        assert_eq!(
            refused,
            OdometerUpdate::RejectedDecrease { current: 51_000.0 }
        );
        let unchanged = store
            .get_vehicle(vehicle.id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(unchanged.odometer_km, 51_000.0);

        let lowered = store
            .update_odometer(vehicle.id, 50_500.0, true)
            .await
            .expect("override");
        assert!(matches!(lowered, OdometerUpdate::Updated { to, .. } if to == 50_500.0));
    }

    #[tokio::test]
    async fn fuel_event_keeps_lower_reading_but_never_lowers_vehicle() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, "u1").await;

        let event = store
            .record_fuel_event(vehicle.id, 1_700_000_000, Some(50_500.0), 40.0, 2_500.0, None)
            .await
            .expect("fuel");
        assert_eq!(event.odometer_km, Some(50_500.0));

        let after = store
            .get_vehicle(vehicle.id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(after.odometer_km, 51_000.0);

        store
            .record_fuel_event(vehicle.id, 1_700_100_000, Some(52_000.0), 40.0, 2_500.0, None)
            .await
            .expect("fuel");
        let after = store
            .get_vehicle(vehicle.id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(after.odometer_km, 52_000.0);
    }

    #[tokio::test]
    async fn service_event_moves_baseline_and_clears_flags() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, "u1").await;
        store
            .mark_flag_fired(
                SubjectKind::Vehicle,
                vehicle.id,
                ThresholdKind::ServiceDistance,
                1_700_000_000,
            )
            .await
            .expect("mark");

        store
            .record_maintenance_event(
                vehicle.id,
                1_700_200_000,
                Some(52_000.0),
                4_000.0,
                "oil and filters",
                SERVICE_CATEGORY,
            )
            .await
            .expect("maintenance");

        let after = store
            .get_vehicle(vehicle.id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(after.last_service_odometer, Some(52_000.0));
        assert_eq!(after.last_service_date, Some(1_700_200_000));
        assert!(!store
            .flag_fired(
                SubjectKind::Vehicle,
                vehicle.id,
                ThresholdKind::ServiceDistance
            )
            .await
            .expect("flag"));
    }

    #[tokio::test]
    async fn non_service_event_leaves_baseline_alone() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, "u1").await;

        store
            .record_maintenance_event(
                vehicle.id,
                1_700_200_000,
                None,
                900.0,
                "wiper blades",
                "parts",
            )
            .await
            .expect("maintenance");

        let after = store
            .get_vehicle(vehicle.id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(after.last_service_odometer, None);
        assert_eq!(after.last_service_date, None);
    }

    #[tokio::test]
    async fn recurring_item_upsert_updates_and_rearms() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, "u1").await;

        let created = store
            .upsert_recurring_item(
                vehicle.id,
                "brake pads",
                Some(40_000.0),
                None,
                Some(30_000.0),
                None,
            )
            .await
            .expect("create item");
        store
            .mark_flag_fired(
                SubjectKind::RecurringItem,
                created.id,
                ThresholdKind::ItemDue,
                1_700_000_000,
            )
            .await
            .expect("mark");

        let updated = store
            .upsert_recurring_item(
                vehicle.id,
                "brake pads",
                Some(70_000.0),
                Some(1_700_300_000),
                Some(30_000.0),
                Some(24),
            )
            .await
            .expect("update item");

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.last_odometer, Some(70_000.0));
        assert_eq!(updated.interval_months, Some(24));
        assert!(!store
            .flag_fired(
                SubjectKind::RecurringItem,
                created.id,
                ThresholdKind::ItemDue
            )
            .await
            .expect("flag"));

        let items = store
            .list_recurring_items(vehicle.id)
            .await
            .expect("list items");
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn flag_mark_is_idempotent_and_clear_is_scoped() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, "u1").await;

        store
            .mark_flag_fired(
                SubjectKind::Vehicle,
                vehicle.id,
                ThresholdKind::ServiceDate,
                100,
            )
            .await
            .expect("mark");
        store
            .mark_flag_fired(
                SubjectKind::Vehicle,
                vehicle.id,
                ThresholdKind::ServiceDate,
                200,
            )
            .await
            .expect("re-mark");
        assert!(store
            .flag_fired(SubjectKind::Vehicle, vehicle.id, ThresholdKind::ServiceDate)
            .await
            .expect("fired"));

        store
            .clear_flags(
                SubjectKind::Vehicle,
                vehicle.id,
                &[ThresholdKind::ServiceDistance],
            )
            .await
            .expect("clear other");
        assert!(store
            .flag_fired(SubjectKind::Vehicle, vehicle.id, ThresholdKind::ServiceDate)
            .await
            .expect("fired"));

        store
            .clear_flags(SubjectKind::Vehicle, vehicle.id, &SERVICE_FLAGS)
            .await
            .expect("clear");
        assert!(!store
            .flag_fired(SubjectKind::Vehicle, vehicle.id, ThresholdKind::ServiceDate)
            .await
            .expect("fired"));
    }

    #[tokio::test]
    async fn cost_totals_sum_per_vehicle() {
        let (_dir, store) = temp_store().await;
        let vehicle = seed_vehicle(&store, "u1").await;
        store
            .record_fuel_event(vehicle.id, 1, None, 30.0, 1_500.0, Some("petrol"))
            .await
            .expect("fuel");
        store
            .record_fuel_event(vehicle.id, 2, None, 20.0, 1_000.0, Some("petrol"))
            .await
            .expect("fuel");
        store
            .record_maintenance_event(vehicle.id, 3, None, 700.0, "bulb", "parts")
            .await
            .expect("maintenance");

        assert_eq!(store.fuel_cost_total(vehicle.id).await.expect("sum"), 2_500.0);
        assert_eq!(
            store
                .maintenance_cost_total(vehicle.id)
                .await
                .expect("sum"),
            700.0
        );
    }
}
