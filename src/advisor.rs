use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};

use crate::config::AdvisorConfig;
use crate::error::Result;
use crate::reminders::{days_between, months_to_seconds};
use crate::stats::StatisticsAggregator;
use crate::store::{GarageStore, Vehicle};

const FALLBACK_ADVICE: &str =
    "Advice is temporarily unavailable. Please try again later.";

const SYSTEM_PROMPT: &str = "You are an experienced master mechanic. Analyze the \
vehicle data and give practical, specific maintenance recommendations. Point out \
missing data instead of inventing it, flag realistic risks, and keep the tone \
friendly and clear for a regular driver.";

/// Advisory text generation through an OpenAI-compatible endpoint. Purely
/// informational: the output is never parsed and never drives reminders.
pub struct Advisor {
    client: Client<OpenAIConfig>,
    model: String,
}

impl Advisor {
    pub fn from_config(config: Option<&AdvisorConfig>) -> Option<Self> {
        let config = config?;
        let api_key = config.api_key.as_deref()?.trim().to_string();
        if api_key.is_empty() {
            return None;
        }
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4.1-mini".to_string());
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url);
        Some(Self {
            client: Client::with_config(openai_config),
            model,
        })
    }

    /// Best effort by contract: any transport or parse failure becomes a
    /// static apology, never an error surfaced to the chat user.
    pub async fn advise(&self, report: &str) -> String {
        let request = match build_request(&self.model, report) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!("failed to build advisor request: {err}");
                return FALLBACK_ADVICE.to_string();
            }
        };

        match self.client.chat().create(request).await {
            Ok(response) => response
                .choices
                .first()
                .and_then(|choice| choice.message.content.clone())
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty())
                .unwrap_or_else(|| FALLBACK_ADVICE.to_string()),
            Err(err) => {
                tracing::error!("advisor endpoint error: {err}");
                FALLBACK_ADVICE.to_string()
            }
        }
    }
}

fn build_request(
    model: &str,
    report: &str,
) -> std::result::Result<
    async_openai::types::chat::CreateChatCompletionRequest,
    async_openai::error::OpenAIError,
> {
    Ok(CreateChatCompletionRequestArgs::default()
        .model(model)
        .messages([
            ChatCompletionRequestSystemMessageArgs::default()
                .content(SYSTEM_PROMPT)
                .build()?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(report)
                .build()?
                .into(),
        ])
        .build()?)
}

/// Snapshot of everything the mechanic persona should see: identity,
/// consumption, service history, insurance runway, parts coming due.
pub async fn vehicle_report(
    store: &GarageStore,
    stats: &StatisticsAggregator,
    vehicle: &Vehicle,
    now: i64,
) -> Result<String> {
    let summary = stats.vehicle_summary(vehicle.id).await?;

    let consumption = summary
        .average_consumption
        .map(|value| format!("{value:.1} l/100km"))
        .unwrap_or_else(|| "no data".to_string());
    let last_service = match (vehicle.last_service_odometer, vehicle.last_service_date) {
        (Some(km), Some(date)) => format!(
            "{km:.0} km on {}",
            crate::conversation::flow::epoch_to_date_label(date)
        ),
        (Some(km), None) => format!("{km:.0} km"),
        (None, Some(date)) => crate::conversation::flow::epoch_to_date_label(date),
        (None, None) => "no data".to_string(),
    };

    let insurance = store
        .list_insurance(vehicle.id)
        .await?
        .into_iter()
        .max_by_key(|policy| policy.end_date)
        .map(|policy| {
            let days = days_between(now, policy.end_date);
            format!(
                "until {} ({days} day(s) left)",
                crate::conversation::flow::epoch_to_date_label(policy.end_date)
            )
        })
        .unwrap_or_else(|| "none on file".to_string());

    let mut upcoming = Vec::new();
    for item in store.list_recurring_items(vehicle.id).await? {
        if let (Some(base), Some(interval)) = (item.last_odometer, item.interval_km) {
            let remaining = base + interval - vehicle.odometer_km;
            if interval > 0.0 && remaining > 0.0 && remaining < 10_000.0 {
                upcoming.push(format!("{} in {remaining:.0} km", item.name));
            }
        }
        if let (Some(base), Some(months)) = (item.last_date, item.interval_months) {
            if months > 0 {
                let days = days_between(now, base + months_to_seconds(months));
                if days > 0 && days < 90 {
                    upcoming.push(format!("{} in {days} day(s)", item.name));
                }
            }
        }
    }
    let upcoming = if upcoming.is_empty() {
        "nothing imminent".to_string()
    } else {
        upcoming.join(", ")
    };

    Ok(format!(
        "Vehicle data:\n\
         - Brand: {}\n\
         - Model: {}\n\
         - Year: {}\n\
         - Odometer: {:.0} km\n\
         - Average consumption: {consumption}\n\
         - Last service: {last_service}\n\
         - Service intervals: {} / {}\n\
         - Insurance: {insurance}\n\
         - Upcoming replacements: {upcoming}\n\
         Give advice on further operation and maintenance.",
        vehicle.brand,
        vehicle.model,
        vehicle.year,
        vehicle.odometer_km,
        vehicle
            .service_interval_km
            .map(|km| format!("{km:.0} km"))
            .unwrap_or_else(|| "not set".to_string()),
        vehicle
            .service_interval_months
            .map(|months| format!("{months} months"))
            .unwrap_or_else(|| "not set".to_string()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    fn advisor_for(server: &MockServer) -> Advisor {
        Advisor::from_config(Some(&AdvisorConfig {
            api_key: Some("test-key".to_string()),
            model: Some("gpt-4.1-mini".to_string()),
            base_url: Some(server.base_url()),
        }))
        .expect("advisor")
    }

    #[tokio::test]
    async fn advise_returns_endpoint_text() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 0,
                "model": "gpt-4.1-mini",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Change the oil soon."},
                    "finish_reason": "stop"
                }]
            }));
        });

        let advisor = advisor_for(&server);
        let advice = advisor.advise("Vehicle data: ...").await;
        mock.assert();
        assert_eq!(advice, "Change the oil soon.");
    }

    #[tokio::test]
    async fn advise_falls_back_on_endpoint_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(500).body("boom");
        });

        let advisor = advisor_for(&server);
        let advice = advisor.advise("Vehicle data: ...").await;
        assert_eq!(advice, FALLBACK_ADVICE);
    }

    #[test]
    fn advisor_requires_an_api_key() {
        assert!(Advisor::from_config(None).is_none());
        assert!(Advisor::from_config(Some(&AdvisorConfig {
            api_key: None,
            model: None,
            base_url: None,
        }))
        .is_none());
        assert!(Advisor::from_config(Some(&AdvisorConfig {
            api_key: Some("  ".to_string()),
            model: None,
            base_url: None,
        }))
        .is_none());
    }
}
