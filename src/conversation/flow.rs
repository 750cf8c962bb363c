use chrono::{Datelike, NaiveDate};
use serde_json::{Map, Value};

use crate::catalog;
use crate::config::Config;
use crate::store::Vehicle;

pub const ODOMETER_MAX_KM: f64 = 5_000_000.0;
pub const MONEY_MAX: f64 = 10_000_000.0;
pub const LITERS_MAX: f64 = 2_000.0;
pub const INTERVAL_KM_MAX: f64 = 1_000_000.0;
pub const YEAR_MIN: i32 = 1900;

pub const SKIP_SENTINEL: &str = "-";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowKind {
    RegisterVehicle,
    UpdateOdometer,
    DeleteVehicle,
    LogFuel,
    LogMaintenance,
    AddInsurance,
    ConfigureService,
    ContactSupport,
}

impl FlowKind {
    pub fn title(self) -> &'static str {
        match self {
            FlowKind::RegisterVehicle => "vehicle registration",
            FlowKind::UpdateOdometer => "odometer update",
            FlowKind::DeleteVehicle => "vehicle removal",
            FlowKind::LogFuel => "fuel log",
            FlowKind::LogMaintenance => "maintenance log",
            FlowKind::AddInsurance => "insurance record",
            FlowKind::ConfigureService => "service reminder setup",
            FlowKind::ContactSupport => "support message",
        }
    }

    fn needs_vehicle(self) -> bool {
        !matches!(self, FlowKind::RegisterVehicle | FlowKind::ContactSupport)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    SelectVehicle,
    SelectBrand,
    ManualBrand,
    SelectModel,
    ManualModel,
    InputYear,
    InputNickname,
    InputOdometer,
    SelectFuelType,
    InputNewOdometer,
    ConfirmDecrease,
    InputLiters,
    InputFuelCost,
    InputFuelOdometer,
    SelectFuelEventType,
    SelectCategory,
    InputDescription,
    InputMaintCost,
    InputMaintOdometer,
    InputEndDate,
    InputInsuranceCost,
    InputPolicyNumber,
    InputCompany,
    InputNotes,
    InputServiceIntervalKm,
    InputServiceIntervalMonths,
    InputItemIntervalKm,
    InputItemIntervalMonths,
    InputSupportMessage,
    Confirm,
}

impl FlowState {
    pub fn is_confirmation(self) -> bool {
        matches!(self, FlowState::Confirm | FlowState::ConfirmDecrease)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Choice {
    Value(String),
    Manual,
    Cancel,
}

/// Structured selection token: `cb:<stage>:<parent>:<choice>`. The parent
/// slot carries the value the choice depends on (e.g. brand for a model
/// pick) and stays empty otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackToken {
    pub stage: String,
    pub parent: Option<String>,
    pub choice: Choice,
}

impl CallbackToken {
    pub fn new(stage: &str, parent: Option<&str>, choice: Choice) -> Self {
        Self {
            stage: stage.to_string(),
            parent: parent.map(str::to_string),
            choice,
        }
    }

    pub fn encode(&self) -> String {
        let parent = self.parent.as_deref().unwrap_or("");
        let choice = match &self.choice {
            Choice::Value(value) => value.as_str(),
            Choice::Manual => "manual",
            Choice::Cancel => "cancel",
        };
        format!("cb:{}:{parent}:{choice}", self.stage)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix("cb:")?;
        let mut parts = rest.splitn(3, ':');
        let stage = parts.next()?.to_string();
        let parent = parts.next()?;
        let choice = parts.next()?;
        if stage.is_empty() || choice.is_empty() {
            return None;
        }
        let parent = if parent.is_empty() {
            None
        } else {
            Some(parent.to_string())
        };
        let choice = match choice {
            "manual" => Choice::Manual,
            "cancel" => Choice::Cancel,
            value => Choice::Value(value.to_string()),
        };
        Some(Self {
            stage,
            parent,
            choice,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserInput {
    Text(String),
    Callback(CallbackToken),
}

impl UserInput {
    /// Raw transport payload: anything shaped like a callback token is one,
    /// everything else is plain text.
    pub fn from_raw(raw: &str) -> Self {
        match CallbackToken::parse(raw.trim()) {
            Some(token) => UserInput::Callback(token),
            None => UserInput::Text(raw.trim().to_string()),
        }
    }

    fn wants_cancel(&self) -> bool {
        match self {
            UserInput::Text(text) => {
                let lowered = text.trim().to_ascii_lowercase();
                lowered == "/cancel" || lowered == "cancel"
            }
            UserInput::Callback(token) => token.choice == Choice::Cancel,
        }
    }
}

/// Everything a transition needs besides the session itself: label tables,
/// the caller's active vehicles (snapshot taken per submit), and today's
/// date. Keeping this read-only keeps `handle` a pure function.
pub struct FlowContext<'a> {
    pub config: &'a Config,
    pub vehicles: &'a [Vehicle],
    pub today: NaiveDate,
}

impl<'a> FlowContext<'a> {
    pub fn selected_vehicle(&self, fields: &Map<String, Value>) -> Option<&'a Vehicle> {
        let id = get_i64(fields, "vehicle_id")? as i32;
        self.vehicles.iter().find(|vehicle| vehicle.id == id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitKind {
    Vehicle,
    OdometerUpdate { allow_decrease: bool },
    DeactivateVehicle,
    FuelEvent,
    MaintenanceEvent,
    InsurancePolicy,
    ServicePlan,
    RecurringItem,
    SupportMessage,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StepAction {
    Reprompt(String),
    Advance { next: FlowState, prompt: String },
    Commit(CommitKind),
    CommitThen {
        kind: CommitKind,
        next: FlowState,
        prompt: String,
    },
    Cancel(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum StartOutcome {
    Begin {
        state: FlowState,
        fields: Map<String, Value>,
        prompt: String,
    },
    Refused(String),
}

const CANCEL_MESSAGE: &str = "Cancelled. Nothing was saved.";

pub fn start_state(flow: FlowKind, ctx: &FlowContext) -> StartOutcome {
    let mut fields = Map::new();

    if flow.needs_vehicle() {
        if ctx.vehicles.is_empty() {
            return StartOutcome::Refused(
                "You have no vehicles yet. Register one first.".to_string(),
            );
        }
        if ctx.vehicles.len() == 1 {
            put_i64(&mut fields, "vehicle_id", ctx.vehicles[0].id as i64);
            let (state, prompt) = after_vehicle_selected(flow, &fields, ctx);
            return StartOutcome::Begin {
                state,
                fields,
                prompt,
            };
        }
        return StartOutcome::Begin {
            state: FlowState::SelectVehicle,
            fields,
            prompt: render_vehicle_menu(ctx.vehicles),
        };
    }

    match flow {
        FlowKind::RegisterVehicle => StartOutcome::Begin {
            state: FlowState::SelectBrand,
            fields,
            prompt: render_brand_menu(),
        },
        FlowKind::ContactSupport => StartOutcome::Begin {
            state: FlowState::InputSupportMessage,
            fields,
            prompt: "Write your message for the administrator (or cancel):".to_string(),
        },
        _ => unreachable!("vehicle-bound flows handled above"),
    }
}

/// The transition table. Pure: reads the input, mutates only the field
/// buffer, and reports what the engine should do next. Storage effects
/// happen in the engine, keyed off the returned `CommitKind`.
pub fn handle(
    flow: FlowKind,
    state: FlowState,
    input: &UserInput,
    fields: &mut Map<String, Value>,
    ctx: &FlowContext,
) -> StepAction {
    if input.wants_cancel() {
        return StepAction::Cancel(CANCEL_MESSAGE.to_string());
    }

    match state {
        FlowState::SelectVehicle => handle_select_vehicle(flow, input, fields, ctx),
        FlowState::SelectBrand => handle_select_brand(input, fields),
        FlowState::ManualBrand => handle_manual_brand(input, fields),
        FlowState::SelectModel => handle_model(input, fields, true),
        FlowState::ManualModel => handle_model(input, fields, false),
        FlowState::InputYear => handle_year(input, fields, ctx),
        FlowState::InputNickname => handle_nickname(input, fields),
        FlowState::InputOdometer => handle_register_odometer(input, fields, ctx),
        FlowState::SelectFuelType => handle_fuel_type(input, fields, ctx, FlowKind::RegisterVehicle),
        FlowState::InputNewOdometer => handle_new_odometer(input, fields, ctx),
        FlowState::ConfirmDecrease => handle_confirm_decrease(input),
        FlowState::InputLiters => handle_liters(input, fields),
        FlowState::InputFuelCost => handle_money(
            input,
            fields,
            "cost",
            FlowState::InputFuelOdometer,
            "Odometer at the pump in km, or '-' to skip:",
        ),
        FlowState::InputFuelOdometer => handle_event_odometer(
            input,
            fields,
            FlowState::SelectFuelEventType,
            |_| render_fuel_menu(ctx.config, "evfuel", true),
        ),
        FlowState::SelectFuelEventType => handle_fuel_type(input, fields, ctx, FlowKind::LogFuel),
        FlowState::SelectCategory => handle_category(input, fields, ctx),
        FlowState::InputDescription => handle_description(input, fields, ctx),
        FlowState::InputMaintCost => handle_money(
            input,
            fields,
            "cost",
            FlowState::InputMaintOdometer,
            "Odometer at the time of work in km, or '-' to skip:",
        ),
        FlowState::InputMaintOdometer => handle_event_odometer(
            input,
            fields,
            FlowState::Confirm,
            |fields| render_summary(FlowKind::LogMaintenance, fields, ctx),
        ),
        FlowState::InputEndDate => handle_end_date(input, fields, ctx),
        FlowState::InputInsuranceCost => handle_money(
            input,
            fields,
            "cost",
            FlowState::InputPolicyNumber,
            "Policy number, or '-' to skip:",
        ),
        FlowState::InputPolicyNumber => handle_optional_text(
            input,
            fields,
            "policy_number",
            FlowState::InputCompany,
            "Insurance company, or '-' to skip:",
        ),
        FlowState::InputCompany => handle_optional_text(
            input,
            fields,
            "company",
            FlowState::InputNotes,
            "Notes, or '-' to skip:",
        ),
        FlowState::InputNotes => {
            let action = handle_optional_text(input, fields, "notes", FlowState::Confirm, "");
            match action {
                StepAction::Advance { next, .. } => StepAction::Advance {
                    next,
                    prompt: render_summary(FlowKind::AddInsurance, fields, ctx),
                },
                other => other,
            }
        }
        FlowState::InputServiceIntervalKm => handle_interval_km(
            input,
            fields,
            "interval_km",
            FlowState::InputServiceIntervalMonths,
            "Service interval in months (0 disables the time reminder):",
        ),
        FlowState::InputServiceIntervalMonths => {
            match parse_interval_months(input) {
                Ok(months) => {
                    put_i64(fields, "interval_months", months as i64);
                    StepAction::Advance {
                        next: FlowState::Confirm,
                        prompt: render_summary(FlowKind::ConfigureService, fields, ctx),
                    }
                }
                Err(reason) => StepAction::Reprompt(reason),
            }
        }
        FlowState::InputItemIntervalKm => handle_interval_km(
            input,
            fields,
            "item_interval_km",
            FlowState::InputItemIntervalMonths,
            "Replacement interval in months (0 = no time reminder):",
        ),
        FlowState::InputItemIntervalMonths => match parse_interval_months(input) {
            Ok(months) => {
                put_i64(fields, "item_interval_months", months as i64);
                StepAction::Commit(CommitKind::RecurringItem)
            }
            Err(reason) => StepAction::Reprompt(reason),
        },
        FlowState::InputSupportMessage => match non_empty_text(input) {
            Some(text) => {
                put_str(fields, "message", text);
                StepAction::Commit(CommitKind::SupportMessage)
            }
            None => StepAction::Reprompt("The message cannot be empty. Try again:".to_string()),
        },
        FlowState::Confirm => handle_confirm(flow, input, fields),
    }
}

fn handle_select_vehicle(
    flow: FlowKind,
    input: &UserInput,
    fields: &mut Map<String, Value>,
    ctx: &FlowContext,
) -> StepAction {
    let chosen = match choice_of(input, "vehicle") {
        Some(Choice::Value(value)) => value,
        _ => return StepAction::Reprompt(render_vehicle_menu(ctx.vehicles)),
    };
    let id = match chosen.parse::<i64>() {
        Ok(id) => id,
        Err(_) => return StepAction::Reprompt(render_vehicle_menu(ctx.vehicles)),
    };
    if !ctx.vehicles.iter().any(|vehicle| vehicle.id as i64 == id) {
        return StepAction::Reprompt(render_vehicle_menu(ctx.vehicles));
    }
    put_i64(fields, "vehicle_id", id);
    let (next, prompt) = after_vehicle_selected(flow, fields, ctx);
    StepAction::Advance { next, prompt }
}

fn after_vehicle_selected(
    flow: FlowKind,
    fields: &Map<String, Value>,
    ctx: &FlowContext,
) -> (FlowState, String) {
    let vehicle = ctx.selected_vehicle(fields);
    let label = vehicle.map(|v| v.label()).unwrap_or_default();
    match flow {
        FlowKind::UpdateOdometer => {
            let current = vehicle.map(|v| v.odometer_km).unwrap_or(0.0);
            (
                FlowState::InputNewOdometer,
                format!("{label}: current odometer {current:.0} km. Enter the new reading:"),
            )
        }
        FlowKind::LogFuel => (
            FlowState::InputLiters,
            format!("{label}: liters filled (e.g. 45.5):"),
        ),
        FlowKind::LogMaintenance => (
            FlowState::SelectCategory,
            render_category_menu(ctx.config),
        ),
        FlowKind::AddInsurance => (
            FlowState::InputEndDate,
            format!("{label}: policy end date as DD.MM.YYYY (e.g. 31.12.2026):"),
        ),
        FlowKind::ConfigureService => (
            FlowState::InputServiceIntervalKm,
            format!(
                "{label}: service interval in km (e.g. 10000; 0 disables the distance reminder):"
            ),
        ),
        FlowKind::DeleteVehicle => (
            FlowState::Confirm,
            format!(
                "{label} will be removed from your garage. Its history is kept. Remove it? (yes/no)"
            ),
        ),
        FlowKind::RegisterVehicle | FlowKind::ContactSupport => {
            // flows without vehicle selection never reach this table
            (FlowState::Confirm, String::new())
        }
    }
}

fn handle_select_brand(input: &UserInput, fields: &mut Map<String, Value>) -> StepAction {
    match choice_of(input, "brand") {
        Some(Choice::Manual) => StepAction::Advance {
            next: FlowState::ManualBrand,
            prompt: "Type the brand name:".to_string(),
        },
        Some(Choice::Value(brand)) if !brand.trim().is_empty() => {
            advance_past_brand(fields, brand.trim())
        }
        _ => StepAction::Reprompt(render_brand_menu()),
    }
}

fn handle_manual_brand(input: &UserInput, fields: &mut Map<String, Value>) -> StepAction {
    match non_empty_text(input) {
        Some(brand) => advance_past_brand(fields, brand),
        None => StepAction::Reprompt("Brand cannot be empty. Type the brand name:".to_string()),
    }
}

/// A brand with catalog models gets the guided model step; anything else
/// (manual entry, unknown brand, brand with no modeled models) skips
/// straight to free-text model entry.
fn advance_past_brand(fields: &mut Map<String, Value>, brand: &str) -> StepAction {
    put_str(fields, "brand", brand);
    if catalog::models_for(brand).is_empty() {
        StepAction::Advance {
            next: FlowState::ManualModel,
            prompt: format!("No model list for {brand}. Type the model name:"),
        }
    } else {
        StepAction::Advance {
            next: FlowState::SelectModel,
            prompt: render_model_menu(brand),
        }
    }
}

fn handle_model(input: &UserInput, fields: &mut Map<String, Value>, guided: bool) -> StepAction {
    if guided {
        if let Some(Choice::Manual) = choice_of(input, "model") {
            return StepAction::Advance {
                next: FlowState::ManualModel,
                prompt: "Type the model name:".to_string(),
            };
        }
    }
    let model = match choice_of(input, "model") {
        Some(Choice::Value(value)) if !value.trim().is_empty() => value.trim().to_string(),
        _ => {
            let brand = get_str(fields, "brand").unwrap_or_default().to_string();
            return StepAction::Reprompt(if guided {
                render_model_menu(&brand)
            } else {
                "Model cannot be empty. Type the model name:".to_string()
            });
        }
    };
    put_str(fields, "model", &model);
    StepAction::Advance {
        next: FlowState::InputYear,
        prompt: "Model year (e.g. 2019):".to_string(),
    }
}

fn handle_year(input: &UserInput, fields: &mut Map<String, Value>, ctx: &FlowContext) -> StepAction {
    let max_year = ctx.today.year() + 1;
    let year = match non_empty_text(input).and_then(|text| text.parse::<i32>().ok()) {
        Some(year) => year,
        None => {
            return StepAction::Reprompt(format!(
                "Enter the year as a number between {YEAR_MIN} and {max_year}:"
            ))
        }
    };
    if year < YEAR_MIN || year > max_year {
        return StepAction::Reprompt(format!(
            "A year between {YEAR_MIN} and {max_year} is expected. Try again:"
        ));
    }
    put_i64(fields, "year", year as i64);
    StepAction::Advance {
        next: FlowState::InputNickname,
        prompt: format!("Nickname for this vehicle, or '{SKIP_SENTINEL}' to skip:"),
    }
}

fn handle_nickname(input: &UserInput, fields: &mut Map<String, Value>) -> StepAction {
    match non_empty_text(input) {
        Some(text) if text == SKIP_SENTINEL => {}
        Some(text) => put_str(fields, "nickname", text),
        None => {
            return StepAction::Reprompt(format!(
                "Send a nickname or '{SKIP_SENTINEL}' to skip:"
            ))
        }
    }
    StepAction::Advance {
        next: FlowState::InputOdometer,
        prompt: "Current odometer reading in km (e.g. 150000):".to_string(),
    }
}

fn handle_register_odometer(
    input: &UserInput,
    fields: &mut Map<String, Value>,
    ctx: &FlowContext,
) -> StepAction {
    match parse_odometer(input) {
        Ok(km) => {
            put_f64(fields, "odometer", km);
            StepAction::Advance {
                next: FlowState::SelectFuelType,
                prompt: render_fuel_menu(ctx.config, "fuel", false),
            }
        }
        Err(reason) => StepAction::Reprompt(reason),
    }
}

fn handle_fuel_type(
    input: &UserInput,
    fields: &mut Map<String, Value>,
    ctx: &FlowContext,
    flow: FlowKind,
) -> StepAction {
    let skippable = flow == FlowKind::LogFuel;
    if skippable {
        if let Some(text) = non_empty_text(input) {
            if text == SKIP_SENTINEL {
                return StepAction::Advance {
                    next: FlowState::Confirm,
                    prompt: render_summary(flow, fields, ctx),
                };
            }
        }
    }
    let stage = if skippable { "evfuel" } else { "fuel" };
    let code = match choice_of(input, stage) {
        Some(Choice::Value(value)) => value.trim().to_ascii_lowercase(),
        _ => return StepAction::Reprompt(render_fuel_menu(ctx.config, stage, skippable)),
    };
    if !ctx.config.fuel_type_labels.contains_key(&code) {
        return StepAction::Reprompt(render_fuel_menu(ctx.config, stage, skippable));
    }
    put_str(fields, "fuel_type", &code);
    StepAction::Advance {
        next: FlowState::Confirm,
        prompt: render_summary(flow, fields, ctx),
    }
}

fn handle_new_odometer(
    input: &UserInput,
    fields: &mut Map<String, Value>,
    ctx: &FlowContext,
) -> StepAction {
    let km = match parse_odometer(input) {
        Ok(km) => km,
        Err(reason) => return StepAction::Reprompt(reason),
    };
    put_f64(fields, "new_odometer", km);
    let current = ctx
        .selected_vehicle(fields)
        .map(|vehicle| vehicle.odometer_km)
        .unwrap_or(0.0);
    if km < current {
        StepAction::Advance {
            next: FlowState::ConfirmDecrease,
            prompt: format!(
                "The new reading ({km:.0} km) is below the stored one ({current:.0} km). \
                 This is only expected after an odometer swap or reset. Lower it anyway? (yes/no)"
            ),
        }
    } else {
        StepAction::Commit(CommitKind::OdometerUpdate {
            allow_decrease: false,
        })
    }
}

fn handle_confirm_decrease(input: &UserInput) -> StepAction {
    match affirmation_of(input) {
        Some(true) => StepAction::Commit(CommitKind::OdometerUpdate {
            allow_decrease: true,
        }),
        Some(false) => StepAction::Cancel(CANCEL_MESSAGE.to_string()),
        None => StepAction::Reprompt(
            "Reply yes to lower the odometer or no to discard.".to_string(),
        ),
    }
}

fn handle_liters(input: &UserInput, fields: &mut Map<String, Value>) -> StepAction {
    let liters = match parse_number(input) {
        Some(value) => value,
        None => return StepAction::Reprompt("Enter the liters as a number (e.g. 45.5):".to_string()),
    };
    if liters <= 0.0 || liters > LITERS_MAX {
        return StepAction::Reprompt(format!(
            "Liters must be above 0 and at most {LITERS_MAX:.0}. Try again:"
        ));
    }
    put_f64(fields, "liters", liters);
    StepAction::Advance {
        next: FlowState::InputFuelCost,
        prompt: "Total cost of the fill-up:".to_string(),
    }
}

fn handle_money(
    input: &UserInput,
    fields: &mut Map<String, Value>,
    key: &str,
    next: FlowState,
    next_prompt: &str,
) -> StepAction {
    let amount = match parse_number(input) {
        Some(value) => value,
        None => return StepAction::Reprompt("Enter the amount as a number (e.g. 2500):".to_string()),
    };
    if amount <= 0.0 || amount > MONEY_MAX {
        return StepAction::Reprompt(format!(
            "The amount must be above 0 and at most {MONEY_MAX:.0}. Try again:"
        ));
    }
    put_f64(fields, key, amount);
    StepAction::Advance {
        next,
        prompt: next_prompt.to_string(),
    }
}

fn handle_event_odometer(
    input: &UserInput,
    fields: &mut Map<String, Value>,
    next: FlowState,
    render_next: impl FnOnce(&Map<String, Value>) -> String,
) -> StepAction {
    // the closure renders the next prompt from the final field buffer
    match non_empty_text(input) {
        Some(text) if text == SKIP_SENTINEL => {}
        _ => match parse_odometer(input) {
            Ok(km) => put_f64(fields, "event_odometer", km),
            Err(reason) => return StepAction::Reprompt(reason),
        },
    }
    let prompt = render_next(fields);
    StepAction::Advance { next, prompt }
}

fn handle_category(
    input: &UserInput,
    fields: &mut Map<String, Value>,
    ctx: &FlowContext,
) -> StepAction {
    let code = match choice_of(input, "cat") {
        Some(Choice::Value(value)) => value.trim().to_ascii_lowercase(),
        _ => return StepAction::Reprompt(render_category_menu(ctx.config)),
    };
    if !ctx.config.maintenance_categories.contains_key(&code) {
        return StepAction::Reprompt(render_category_menu(ctx.config));
    }
    let prompt = if code == "parts" {
        "Which part was replaced? (this also names the recurring item)".to_string()
    } else {
        "Describe the work done (e.g. oil and filter change):".to_string()
    };
    put_str(fields, "category", &code);
    StepAction::Advance {
        next: FlowState::InputDescription,
        prompt,
    }
}

fn handle_description(
    input: &UserInput,
    fields: &mut Map<String, Value>,
    _ctx: &FlowContext,
) -> StepAction {
    match non_empty_text(input) {
        Some(text) => {
            put_str(fields, "description", text);
            StepAction::Advance {
                next: FlowState::InputMaintCost,
                prompt: "Cost of the work:".to_string(),
            }
        }
        None => StepAction::Reprompt("The description cannot be empty. Try again:".to_string()),
    }
}

fn handle_end_date(
    input: &UserInput,
    fields: &mut Map<String, Value>,
    ctx: &FlowContext,
) -> StepAction {
    let text = match non_empty_text(input) {
        Some(text) => text,
        None => {
            return StepAction::Reprompt(
                "Enter the end date as DD.MM.YYYY (e.g. 31.12.2026):".to_string(),
            )
        }
    };
    let date = match NaiveDate::parse_from_str(text, "%d.%m.%Y") {
        Ok(date) => date,
        Err(_) => {
            return StepAction::Reprompt(
                "That is not a DD.MM.YYYY date. Try again (e.g. 31.12.2026):".to_string(),
            )
        }
    };
    if date < ctx.today {
        return StepAction::Reprompt(
            "The end date cannot be in the past. Enter a future date:".to_string(),
        );
    }
    put_i64(fields, "end_date", date_to_epoch(date));
    StepAction::Advance {
        next: FlowState::InputInsuranceCost,
        prompt: "Cost of the policy:".to_string(),
    }
}

fn handle_optional_text(
    input: &UserInput,
    fields: &mut Map<String, Value>,
    key: &str,
    next: FlowState,
    next_prompt: &str,
) -> StepAction {
    match non_empty_text(input) {
        Some(text) if text == SKIP_SENTINEL => {}
        Some(text) => put_str(fields, key, text),
        None => {
            return StepAction::Reprompt(format!(
                "Send a value or '{SKIP_SENTINEL}' to skip:"
            ))
        }
    }
    StepAction::Advance {
        next,
        prompt: next_prompt.to_string(),
    }
}

fn handle_interval_km(
    input: &UserInput,
    fields: &mut Map<String, Value>,
    key: &str,
    next: FlowState,
    next_prompt: &str,
) -> StepAction {
    let km = match parse_number(input) {
        Some(value) => value,
        None => {
            return StepAction::Reprompt("Enter the interval in km as a number (0 = none):".to_string())
        }
    };
    if km < 0.0 || km >= INTERVAL_KM_MAX {
        return StepAction::Reprompt(format!(
            "The interval must be between 0 and {INTERVAL_KM_MAX:.0} km. Try again:"
        ));
    }
    put_f64(fields, key, km);
    StepAction::Advance {
        next,
        prompt: next_prompt.to_string(),
    }
}

fn parse_interval_months(input: &UserInput) -> Result<i32, String> {
    let months = non_empty_text(input)
        .and_then(|text| text.parse::<i32>().ok())
        .ok_or_else(|| "Enter the interval in months as a whole number (0 = none):".to_string())?;
    if !(0..=600).contains(&months) {
        return Err("The interval must be between 0 and 600 months. Try again:".to_string());
    }
    Ok(months)
}

fn handle_confirm(
    flow: FlowKind,
    input: &UserInput,
    fields: &mut Map<String, Value>,
) -> StepAction {
    match affirmation_of(input) {
        Some(true) => {
            let kind = match flow {
                FlowKind::RegisterVehicle => CommitKind::Vehicle,
                FlowKind::DeleteVehicle => CommitKind::DeactivateVehicle,
                FlowKind::LogFuel => CommitKind::FuelEvent,
                FlowKind::LogMaintenance => CommitKind::MaintenanceEvent,
                FlowKind::AddInsurance => CommitKind::InsurancePolicy,
                FlowKind::ConfigureService => CommitKind::ServicePlan,
                FlowKind::UpdateOdometer | FlowKind::ContactSupport => {
                    return StepAction::Reprompt(
                        "Reply yes to save or no to discard.".to_string(),
                    )
                }
            };
            if flow == FlowKind::LogMaintenance && get_str(fields, "category") == Some("parts") {
                return StepAction::CommitThen {
                    kind,
                    next: FlowState::InputItemIntervalKm,
                    prompt: "Saved. Replacement interval in km for this part (0 = no distance reminder):"
                        .to_string(),
                };
            }
            StepAction::Commit(kind)
        }
        Some(false) => StepAction::Cancel(CANCEL_MESSAGE.to_string()),
        None => StepAction::Reprompt("Reply yes to save or no to discard.".to_string()),
    }
}

fn choice_of(input: &UserInput, stage: &str) -> Option<Choice> {
    match input {
        UserInput::Callback(token) => {
            if token.stage == stage {
                Some(token.choice.clone())
            } else {
                None
            }
        }
        UserInput::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else if trimmed.eq_ignore_ascii_case("manual") {
                Some(Choice::Manual)
            } else {
                Some(Choice::Value(trimmed.to_string()))
            }
        }
    }
}

fn non_empty_text(input: &UserInput) -> Option<&str> {
    match input {
        UserInput::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        }
        UserInput::Callback(_) => None,
    }
}

fn affirmation_of(input: &UserInput) -> Option<bool> {
    let text = match input {
        UserInput::Text(text) => text.trim().to_ascii_lowercase(),
        UserInput::Callback(token) => match &token.choice {
            Choice::Value(value) => value.trim().to_ascii_lowercase(),
            _ => return None,
        },
    };
    match text.as_str() {
        "yes" | "y" | "save" | "confirm" => Some(true),
        "no" | "n" | "discard" => Some(false),
        _ => None,
    }
}

fn parse_number(input: &UserInput) -> Option<f64> {
    let text = non_empty_text(input)?;
    let normalized = text.replace(',', ".").replace(' ', "");
    normalized.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn parse_odometer(input: &UserInput) -> Result<f64, String> {
    let km = parse_number(input)
        .ok_or_else(|| "Enter the odometer as a number (e.g. 150000):".to_string())?;
    if !(0.0..=ODOMETER_MAX_KM).contains(&km) {
        return Err(format!(
            "The odometer must be between 0 and {ODOMETER_MAX_KM:.0} km. Try again:"
        ));
    }
    Ok(km)
}

pub fn date_to_epoch(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

fn menu_line(token: &CallbackToken, label: &str) -> String {
    format!("  [{}] {label}", token.encode())
}

pub fn render_vehicle_menu(vehicles: &[Vehicle]) -> String {
    let mut lines = vec!["Pick a vehicle:".to_string()];
    for vehicle in vehicles {
        let token = CallbackToken::new(
            "vehicle",
            None,
            Choice::Value(vehicle.id.to_string()),
        );
        lines.push(menu_line(
            &token,
            &format!("{} — {:.0} km", vehicle.label(), vehicle.odometer_km),
        ));
    }
    lines.join("\n")
}

pub fn render_brand_menu() -> String {
    let mut lines = vec!["Pick a brand:".to_string()];
    for brand in catalog::brands() {
        let token = CallbackToken::new("brand", None, Choice::Value(brand.to_string()));
        lines.push(menu_line(&token, brand));
    }
    let manual = CallbackToken::new("brand", None, Choice::Manual);
    lines.push(menu_line(&manual, "Another brand (type it in)"));
    lines.join("\n")
}

pub fn render_model_menu(brand: &str) -> String {
    let mut lines = vec![format!("Pick a {brand} model:")];
    for model in catalog::models_for(brand) {
        let token = CallbackToken::new("model", Some(brand), Choice::Value(model.to_string()));
        lines.push(menu_line(&token, model));
    }
    let manual = CallbackToken::new("model", Some(brand), Choice::Manual);
    lines.push(menu_line(&manual, "Another model (type it in)"));
    lines.join("\n")
}

fn render_fuel_menu(config: &Config, stage: &str, skippable: bool) -> String {
    let mut lines = vec!["Pick the fuel type:".to_string()];
    for code in config.fuel_type_codes() {
        let token = CallbackToken::new(stage, None, Choice::Value(code.clone()));
        lines.push(menu_line(&token, config.fuel_type_label(&code)));
    }
    if skippable {
        lines.push(format!("  (or send '{SKIP_SENTINEL}' to skip)"));
    }
    lines.join("\n")
}

fn render_category_menu(config: &Config) -> String {
    let mut lines = vec!["Pick the maintenance category:".to_string()];
    for code in config.maintenance_category_codes() {
        let token = CallbackToken::new("cat", None, Choice::Value(code.clone()));
        lines.push(menu_line(&token, config.maintenance_category_label(&code)));
    }
    lines.join("\n")
}

pub fn render_summary(flow: FlowKind, fields: &Map<String, Value>, ctx: &FlowContext) -> String {
    let vehicle_label = ctx
        .selected_vehicle(fields)
        .map(|vehicle| vehicle.label())
        .unwrap_or_default();
    let mut lines = vec![format!("Please review the {}:", flow.title())];
    match flow {
        FlowKind::RegisterVehicle => {
            lines.push(format!(
                "  Brand: {}",
                get_str(fields, "brand").unwrap_or_default()
            ));
            lines.push(format!(
                "  Model: {}",
                get_str(fields, "model").unwrap_or_default()
            ));
            lines.push(format!(
                "  Year: {}",
                get_i64(fields, "year").unwrap_or_default()
            ));
            if let Some(nickname) = get_str(fields, "nickname") {
                lines.push(format!("  Nickname: {nickname}"));
            }
            lines.push(format!(
                "  Odometer: {:.0} km",
                get_f64(fields, "odometer").unwrap_or_default()
            ));
            if let Some(code) = get_str(fields, "fuel_type") {
                lines.push(format!("  Fuel: {}", ctx.config.fuel_type_label(code)));
            }
        }
        FlowKind::LogFuel => {
            lines.push(format!("  Vehicle: {vehicle_label}"));
            lines.push(format!(
                "  Liters: {:.2}",
                get_f64(fields, "liters").unwrap_or_default()
            ));
            lines.push(format!(
                "  Cost: {:.2}",
                get_f64(fields, "cost").unwrap_or_default()
            ));
            if let Some(km) = get_f64(fields, "event_odometer") {
                lines.push(format!("  Odometer: {km:.0} km"));
            }
            if let Some(code) = get_str(fields, "fuel_type") {
                lines.push(format!("  Fuel: {}", ctx.config.fuel_type_label(code)));
            }
        }
        FlowKind::LogMaintenance => {
            lines.push(format!("  Vehicle: {vehicle_label}"));
            if let Some(code) = get_str(fields, "category") {
                lines.push(format!(
                    "  Category: {}",
                    ctx.config.maintenance_category_label(code)
                ));
            }
            lines.push(format!(
                "  Work: {}",
                get_str(fields, "description").unwrap_or_default()
            ));
            lines.push(format!(
                "  Cost: {:.2}",
                get_f64(fields, "cost").unwrap_or_default()
            ));
            if let Some(km) = get_f64(fields, "event_odometer") {
                lines.push(format!("  Odometer: {km:.0} km"));
            }
            if get_str(fields, "category") == Some("service") {
                lines.push("  (this resets the service reminder baseline)".to_string());
            }
        }
        FlowKind::AddInsurance => {
            lines.push(format!("  Vehicle: {vehicle_label}"));
            if let Some(epoch) = get_i64(fields, "end_date") {
                lines.push(format!("  Valid until: {}", epoch_to_date_label(epoch)));
            }
            lines.push(format!(
                "  Cost: {:.2}",
                get_f64(fields, "cost").unwrap_or_default()
            ));
            if let Some(policy) = get_str(fields, "policy_number") {
                lines.push(format!("  Policy no: {policy}"));
            }
            if let Some(company) = get_str(fields, "company") {
                lines.push(format!("  Company: {company}"));
            }
            if let Some(notes) = get_str(fields, "notes") {
                lines.push(format!("  Notes: {notes}"));
            }
        }
        FlowKind::ConfigureService => {
            lines.push(format!("  Vehicle: {vehicle_label}"));
            let km = get_f64(fields, "interval_km").unwrap_or_default();
            let months = get_i64(fields, "interval_months").unwrap_or_default();
            lines.push(format!(
                "  Distance interval: {}",
                if km > 0.0 {
                    format!("{km:.0} km")
                } else {
                    "disabled".to_string()
                }
            ));
            lines.push(format!(
                "  Time interval: {}",
                if months > 0 {
                    format!("{months} months")
                } else {
                    "disabled".to_string()
                }
            ));
        }
        FlowKind::UpdateOdometer | FlowKind::DeleteVehicle | FlowKind::ContactSupport => {}
    }
    lines.push("Save it? (yes/no)".to_string());
    lines.join("\n")
}

pub fn epoch_to_date_label(epoch: i64) -> String {
    chrono::DateTime::from_timestamp(epoch, 0)
        .map(|dt| dt.format("%d.%m.%Y").to_string())
        .unwrap_or_else(|| epoch.to_string())
}

pub(crate) fn put_str(fields: &mut Map<String, Value>, key: &str, value: &str) {
    fields.insert(key.to_string(), Value::String(value.to_string()));
}

pub(crate) fn put_f64(fields: &mut Map<String, Value>, key: &str, value: f64) {
    if let Some(number) = serde_json::Number::from_f64(value) {
        fields.insert(key.to_string(), Value::Number(number));
    }
}

pub(crate) fn put_i64(fields: &mut Map<String, Value>, key: &str, value: i64) {
    fields.insert(key.to_string(), Value::Number(value.into()));
}

pub(crate) fn get_str<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

pub(crate) fn get_f64(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    fields.get(key).and_then(Value::as_f64)
}

pub(crate) fn get_i64(fields: &Map<String, Value>, key: &str) -> Option<i64> {
    fields.get(key).and_then(Value::as_i64)
}
