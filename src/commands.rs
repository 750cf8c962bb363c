use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use crate::advisor::{self, Advisor};
use crate::config::Config;
use crate::conversation::{ConversationEngine, FlowKind, UserInput};
use crate::error::Result;
use crate::export;
use crate::interfaces::notifier::Notifier;
use crate::reminders::{days_between, months_to_seconds};
use crate::stats::StatisticsAggregator;
use crate::store::{now_ts, GarageStore};

/// The transport-agnostic chat command surface. Every command either
/// performs a direct read or starts a conversation flow; free text outside
/// a flow gets the help text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    AddVehicle,
    MyVehicles,
    UpdateOdometer,
    DeleteVehicle,
    LogFuel,
    LogMaintenance,
    AddInsurance,
    MyInsurances,
    SetServiceReminder,
    ShowReminders,
    PartsDue,
    Stats,
    VehicleStats,
    Export,
    Advice,
    ContactSupport,
    Cancel,
}

impl Command {
    pub fn parse(text: &str) -> Option<Self> {
        let command = text.trim().split_whitespace().next()?;
        Some(match command {
            "/start" => Command::Start,
            "/help" => Command::Help,
            "/add_car" => Command::AddVehicle,
            "/my_cars" => Command::MyVehicles,
            "/update_odometer" => Command::UpdateOdometer,
            "/delete_car" => Command::DeleteVehicle,
            "/fuel" => Command::LogFuel,
            "/maintenance" => Command::LogMaintenance,
            "/add_insurance" => Command::AddInsurance,
            "/my_insurances" => Command::MyInsurances,
            "/set_service_reminder" => Command::SetServiceReminder,
            "/show_reminders" => Command::ShowReminders,
            "/parts" => Command::PartsDue,
            "/stats" => Command::Stats,
            "/vehicle_stats" => Command::VehicleStats,
            "/export" => Command::Export,
            "/advice" => Command::Advice,
            "/feedback" => Command::ContactSupport,
            "/cancel" => Command::Cancel,
            _ => return None,
        })
    }

    fn flow(self) -> Option<FlowKind> {
        Some(match self {
            Command::AddVehicle => FlowKind::RegisterVehicle,
            Command::UpdateOdometer => FlowKind::UpdateOdometer,
            Command::DeleteVehicle => FlowKind::DeleteVehicle,
            Command::LogFuel => FlowKind::LogFuel,
            Command::LogMaintenance => FlowKind::LogMaintenance,
            Command::AddInsurance => FlowKind::AddInsurance,
            Command::SetServiceReminder => FlowKind::ConfigureService,
            Command::ContactSupport => FlowKind::ContactSupport,
            _ => return None,
        })
    }
}

const HELP_TEXT: &str = "Garage Bot keeps your vehicle costs and reminders in one place.\n\
\n\
Vehicles:\n\
  /add_car - register a vehicle\n\
  /my_cars - list your vehicles\n\
  /update_odometer - record the current reading\n\
  /delete_car - remove a vehicle (history is kept)\n\
Logs:\n\
  /fuel - log a fill-up\n\
  /maintenance - log maintenance or a part replacement\n\
  /add_insurance - add an insurance policy\n\
  /my_insurances - list policies\n\
Reminders:\n\
  /set_service_reminder - configure service intervals\n\
  /show_reminders - current reminder settings\n\
  /parts - upcoming part replacements\n\
Insights:\n\
  /stats - totals across the garage\n\
  /vehicle_stats - per-vehicle totals and consumption\n\
  /advice - mechanic-style advice for a vehicle\n\
  /export - all records as CSV\n\
Other:\n\
  /feedback - message the administrator\n\
  /cancel - abort the current entry";

pub struct CommandRouter {
    store: Arc<GarageStore>,
    config: Arc<Config>,
    engine: Arc<ConversationEngine>,
    stats: StatisticsAggregator,
    advisor: Option<Advisor>,
    notifier: Arc<dyn Notifier>,
}

impl CommandRouter {
    pub fn new(
        store: Arc<GarageStore>,
        config: Arc<Config>,
        engine: Arc<ConversationEngine>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let advisor = Advisor::from_config(config.advisor.as_ref());
        Self {
            stats: StatisticsAggregator::new(store.clone()),
            store,
            config,
            engine,
            advisor,
            notifier,
        }
    }

    /// One inbound chat message or button press, processed to completion.
    pub async fn handle_message(&self, user_id: &str, raw: &str) -> Result<String> {
        if let Some(reply) = self.try_admin_reply(user_id, raw).await? {
            return Ok(reply);
        }

        if let Some(command) = Command::parse(raw) {
            return self.run_command(command, user_id).await;
        }

        if self.engine.has_active_session(user_id).await {
            let outcome = self
                .engine
                .submit(user_id, UserInput::from_raw(raw))
                .await?;
            return Ok(outcome.message().to_string());
        }

        Ok(HELP_TEXT.to_string())
    }

    async fn run_command(&self, command: Command, user_id: &str) -> Result<String> {
        if let Some(flow) = command.flow() {
            return self.engine.start(flow, user_id).await;
        }

        // a read command mid-flow abandons the unfinished entry
        let discarded = self.engine.discard(user_id).await;

        let mut reply = match command {
            Command::Start | Command::Help => HELP_TEXT.to_string(),
            Command::Cancel => {
                if discarded {
                    "Cancelled. Nothing was saved.".to_string()
                } else {
                    "Nothing to cancel.".to_string()
                }
            }
            Command::MyVehicles => self.list_vehicles_text(user_id).await?,
            Command::MyInsurances => self.list_insurances_text(user_id).await?,
            Command::ShowReminders => self.reminder_settings_text(user_id).await?,
            Command::PartsDue => self.parts_due_text(user_id).await?,
            Command::Stats => self.owner_stats_text(user_id).await?,
            Command::VehicleStats => self.vehicle_stats_text(user_id).await?,
            Command::Export => export::owner_csv(&self.store, user_id).await?,
            Command::Advice => self.advice_text(user_id).await?,
            _ => HELP_TEXT.to_string(),
        };

        if discarded && command != Command::Cancel {
            reply = format!("(Your unfinished entry was discarded.)\n\n{reply}");
        }
        Ok(reply)
    }

    /// Admin shortcut for answering `/feedback` messages:
    /// `/reply <user id> <text>` sends the text back to that user.
    async fn try_admin_reply(&self, user_id: &str, raw: &str) -> Result<Option<String>> {
        let admin = match &self.config.admin_chat_id {
            Some(admin) if admin == user_id => admin.clone(),
            _ => return Ok(None),
        };

        static REPLY_RE: OnceLock<Regex> = OnceLock::new();
        let re = REPLY_RE
            .get_or_init(|| Regex::new(r"^/reply\s+(\S+)\s+([\s\S]+)$").expect("valid reply regex"));
        let caps = match re.captures(raw.trim()) {
            Some(caps) => caps,
            None => return Ok(None),
        };
        let target = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

        match self
            .notifier
            .send(target, &format!("Reply from the administrator:\n\n{body}"))
            .await
        {
            Ok(()) => Ok(Some(format!("Reply sent to {target}."))),
            Err(err) => {
                tracing::warn!(admin, target, "admin reply failed: {err}");
                Ok(Some(format!("Could not deliver the reply to {target}.")))
            }
        }
    }

    async fn list_vehicles_text(&self, user_id: &str) -> Result<String> {
        let vehicles = self.store.list_vehicles(user_id).await?;
        if vehicles.is_empty() {
            return Ok("You have no vehicles yet. Use /add_car to register one.".to_string());
        }
        let mut lines = vec!["Your vehicles:".to_string()];
        for vehicle in vehicles {
            let summary = self.stats.vehicle_summary(vehicle.id).await?;
            lines.push(format!(
                "{} - {:.0} km, {}, spent {:.2} total (id {})",
                vehicle.label(),
                vehicle.odometer_km,
                self.config.fuel_type_label(&vehicle.fuel_type),
                summary.total,
                vehicle.id
            ));
        }
        Ok(lines.join("\n"))
    }

    async fn list_insurances_text(&self, user_id: &str) -> Result<String> {
        let vehicles = self.store.list_vehicles(user_id).await?;
        if vehicles.is_empty() {
            return Ok("You have no vehicles yet. Use /add_car to register one.".to_string());
        }
        let now = now_ts();
        let mut lines = Vec::new();
        for vehicle in vehicles {
            let policies = self.store.list_insurance(vehicle.id).await?;
            if policies.is_empty() {
                continue;
            }
            lines.push(format!("{}:", vehicle.label()));
            for policy in policies {
                let days_left = days_between(now, policy.end_date);
                let status = if days_left < 0 {
                    "expired".to_string()
                } else if days_left <= 7 {
                    format!("expires in {days_left} day(s)")
                } else {
                    "active".to_string()
                };
                lines.push(format!(
                    "  until {} - {:.2} ({status})",
                    crate::conversation::flow::epoch_to_date_label(policy.end_date),
                    policy.cost
                ));
            }
        }
        if lines.is_empty() {
            return Ok("No insurance policies on file yet. Use /add_insurance.".to_string());
        }
        Ok(lines.join("\n"))
    }

    async fn reminder_settings_text(&self, user_id: &str) -> Result<String> {
        let vehicles = self.store.list_vehicles(user_id).await?;
        if vehicles.is_empty() {
            return Ok("You have no vehicles yet. Use /add_car to register one.".to_string());
        }
        let mut lines = vec!["Service reminder settings:".to_string()];
        for vehicle in vehicles {
            let km = vehicle
                .service_interval_km
                .map(|km| format!("{km:.0} km"))
                .unwrap_or_else(|| "not set".to_string());
            let months = vehicle
                .service_interval_months
                .map(|months| format!("{months} months"))
                .unwrap_or_else(|| "not set".to_string());
            let last = match (vehicle.last_service_odometer, vehicle.last_service_date) {
                (Some(base), Some(date)) => format!(
                    "{base:.0} km on {}",
                    crate::conversation::flow::epoch_to_date_label(date)
                ),
                (Some(base), None) => format!("{base:.0} km"),
                (None, Some(date)) => crate::conversation::flow::epoch_to_date_label(date),
                (None, None) => "no data".to_string(),
            };
            lines.push(format!(
                "{}: last service {last}; interval {km} / {months}",
                vehicle.label()
            ));
        }
        Ok(lines.join("\n"))
    }

    async fn parts_due_text(&self, user_id: &str) -> Result<String> {
        let vehicles = self.store.list_vehicles(user_id).await?;
        if vehicles.is_empty() {
            return Ok("You have no vehicles yet. Use /add_car to register one.".to_string());
        }
        let now = now_ts();
        let mut lines = vec!["Planned replacements:".to_string()];
        let mut found = false;
        for vehicle in vehicles {
            for item in self.store.list_recurring_items(vehicle.id).await? {
                let mut notes = Vec::new();
                if let (Some(base), Some(interval)) = (item.last_odometer, item.interval_km) {
                    if interval > 0.0 {
                        let remaining = base + interval - vehicle.odometer_km;
                        if remaining <= 0.0 {
                            notes.push("distance limit reached, replace now".to_string());
                        } else {
                            notes.push(format!("{remaining:.0} km left"));
                        }
                    }
                }
                if let (Some(base), Some(months)) = (item.last_date, item.interval_months) {
                    if months > 0 {
                        let days_left = days_between(now, base + months_to_seconds(months));
                        if days_left <= 0 {
                            notes.push("time limit reached, replace now".to_string());
                        } else {
                            notes.push(format!("{days_left} day(s) left"));
                        }
                    }
                }
                if !notes.is_empty() {
                    found = true;
                    lines.push(format!(
                        "{}: {} - {}",
                        vehicle.label(),
                        item.name,
                        notes.join(", ")
                    ));
                }
            }
        }
        if !found {
            lines.push("Everything is on schedule, nothing due.".to_string());
        }
        Ok(lines.join("\n"))
    }

    async fn owner_stats_text(&self, user_id: &str) -> Result<String> {
        let summary = self.stats.owner_summary(user_id).await?;
        if summary.vehicles == 0 {
            return Ok("You have no vehicles yet. Use /add_car to register one.".to_string());
        }
        Ok(format!(
            "Garage totals:\n\
             Vehicles: {}\n\
             Spent in total: {:.2}\n\
             Fuel: {:.2}\n\
             Maintenance: {:.2}",
            summary.vehicles, summary.total, summary.fuel_total, summary.maintenance_total
        ))
    }

    async fn vehicle_stats_text(&self, user_id: &str) -> Result<String> {
        let vehicles = self.store.list_vehicles(user_id).await?;
        if vehicles.is_empty() {
            return Ok("You have no vehicles yet. Use /add_car to register one.".to_string());
        }
        let mut lines = Vec::new();
        for vehicle in vehicles {
            let summary = self.stats.vehicle_summary(vehicle.id).await?;
            let consumption = summary
                .average_consumption
                .map(|value| format!("{value:.1} l/100km"))
                .unwrap_or_else(|| "no data".to_string());
            lines.push(format!(
                "{}:\n  odometer {:.0} km\n  fuel {:.2}, maintenance {:.2}, total {:.2}\n  consumption {consumption}",
                vehicle.label(),
                vehicle.odometer_km,
                summary.fuel_total,
                summary.maintenance_total,
                summary.total
            ));
        }
        Ok(lines.join("\n"))
    }

    async fn advice_text(&self, user_id: &str) -> Result<String> {
        let advisor = match &self.advisor {
            Some(advisor) => advisor,
            None => return Ok("Advice is not configured on this deployment.".to_string()),
        };
        let vehicles = self.store.list_vehicles(user_id).await?;
        let vehicle = match vehicles.first() {
            Some(vehicle) => vehicle,
            None => {
                return Ok("You have no vehicles yet. Use /add_car to register one.".to_string())
            }
        };
        let report =
            advisor::vehicle_report(&self.store, &self.stats, vehicle, now_ts()).await?;
        Ok(advisor.advise(&report).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::notifier::NoopNotifier;

    #[test]
    fn commands_parse_with_arguments_and_unknowns_fall_through() {
        assert_eq!(Command::parse("/my_cars"), Some(Command::MyVehicles));
        assert_eq!(Command::parse("  /stats  "), Some(Command::Stats));
        assert_eq!(Command::parse("/fuel now"), Some(Command::LogFuel));
        assert_eq!(Command::parse("fuel"), None);
        assert_eq!(Command::parse("/unknown"), None);
    }

    async fn test_router() -> (tempfile::TempDir, CommandRouter) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("garage.db");
        let store = Arc::new(
            GarageStore::new(db_path.to_string_lossy())
                .await
                .expect("store"),
        );
        let config = Arc::new(Config::convention_defaults());
        let notifier: Arc<dyn Notifier> = Arc::new(NoopNotifier);
        let engine = Arc::new(ConversationEngine::new(
            store.clone(),
            config.clone(),
            notifier.clone(),
        ));
        (dir, CommandRouter::new(store, config, engine, notifier))
    }

    #[tokio::test]
    async fn free_text_outside_a_flow_gets_help() {
        let (_dir, router) = test_router().await;
        let reply = router.handle_message("u1", "hello there").await.expect("reply");
        assert!(reply.contains("/add_car"));
    }

    #[tokio::test]
    async fn vehicle_commands_refuse_an_empty_garage() {
        let (_dir, router) = test_router().await;
        for command in ["/fuel", "/my_cars", "/stats", "/parts", "/show_reminders"] {
            let reply = router.handle_message("u1", command).await.expect("reply");
            assert!(
                reply.contains("no vehicles"),
                "{command} should mention the empty garage, got: {reply}"
            );
        }
    }

    #[tokio::test]
    async fn read_command_mid_flow_discards_the_session() {
        let (_dir, router) = test_router().await;
        router.handle_message("u1", "/add_car").await.expect("start");
        assert!(router.engine.has_active_session("u1").await);

        let reply = router.handle_message("u1", "/help").await.expect("help");
        assert!(reply.contains("discarded"));
        assert!(!router.engine.has_active_session("u1").await);
    }

    #[tokio::test]
    async fn cancel_without_session_says_so() {
        let (_dir, router) = test_router().await;
        let reply = router.handle_message("u1", "/cancel").await.expect("reply");
        assert_eq!(reply, "Nothing to cancel.");
    }
}
