use crate::error::Result;
use crate::store::GarageStore;

const HEADER: [&str; 11] = [
    "type",
    "vehicle",
    "date",
    "detail",
    "odometer_km",
    "cost",
    "liters",
    "category",
    "policy",
    "interval_km",
    "interval_months",
];

/// Flat semicolon-separated table of every record the owner has, one row
/// per event across all categories, each labelled with its vehicle.
pub async fn owner_csv(store: &GarageStore, owner_id: &str) -> Result<String> {
    let mut rows: Vec<Vec<String>> = vec![HEADER.iter().map(|s| s.to_string()).collect()];

    for vehicle in store.list_vehicles(owner_id).await? {
        let label = format!("{} {} ({})", vehicle.brand, vehicle.model, vehicle.year);

        for event in store.list_fuel_events(vehicle.id, 0).await? {
            rows.push(vec![
                "fuel".to_string(),
                label.clone(),
                timestamp_label(event.occurred_at),
                String::new(),
                event
                    .odometer_km
                    .map(|km| format!("{km:.0}"))
                    .unwrap_or_default(),
                format!("{:.2}", event.cost),
                format!("{:.2}", event.liters),
                event.fuel_type.unwrap_or_default(),
                String::new(),
                String::new(),
                String::new(),
            ]);
        }

        for event in store.list_maintenance_events(vehicle.id, 0).await? {
            rows.push(vec![
                "maintenance".to_string(),
                label.clone(),
                timestamp_label(event.occurred_at),
                event.description,
                event
                    .odometer_km
                    .map(|km| format!("{km:.0}"))
                    .unwrap_or_default(),
                format!("{:.2}", event.cost),
                String::new(),
                event.category,
                String::new(),
                String::new(),
                String::new(),
            ]);
        }

        for policy in store.list_insurance(vehicle.id).await? {
            let contact = match (&policy.policy_number, &policy.company) {
                (Some(number), Some(company)) => format!("{number} / {company}"),
                (Some(number), None) => number.clone(),
                (None, Some(company)) => company.clone(),
                (None, None) => String::new(),
            };
            rows.push(vec![
                "insurance".to_string(),
                label.clone(),
                timestamp_label(policy.end_date),
                policy.notes.unwrap_or_default(),
                String::new(),
                format!("{:.2}", policy.cost),
                String::new(),
                String::new(),
                contact,
                String::new(),
                String::new(),
            ]);
        }

        for item in store.list_recurring_items(vehicle.id).await? {
            rows.push(vec![
                "part".to_string(),
                label.clone(),
                item.last_date.map(timestamp_label).unwrap_or_default(),
                item.name,
                item.last_odometer
                    .map(|km| format!("{km:.0}"))
                    .unwrap_or_default(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                item.interval_km
                    .map(|km| format!("{km:.0}"))
                    .unwrap_or_default(),
                item.interval_months
                    .map(|months| months.to_string())
                    .unwrap_or_default(),
            ]);
        }
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|field| escape_field(&field))
                .collect::<Vec<_>>()
                .join(";")
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

fn escape_field(field: &str) -> String {
    if field.contains([';', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn timestamp_label(epoch: i64) -> String {
    chrono::DateTime::from_timestamp(epoch, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| epoch.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewVehicle;

    #[tokio::test]
    async fn export_covers_every_record_family() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("garage.db");
        let store = GarageStore::new(db_path.to_string_lossy())
            .await
            .expect("store");

        let vehicle = store
            .create_vehicle(NewVehicle {
                owner_id: "u1",
                brand: "Skoda",
                model: "Octavia",
                year: 2021,
                nickname: None,
                odometer_km: 30_000.0,
                fuel_type: "petrol",
            })
            .await
            .expect("vehicle");
        store
            .record_fuel_event(vehicle.id, 1_700_000_000, Some(30_000.0), 42.0, 2_100.0, Some("petrol"))
            .await
            .expect("fuel");
        store
            .record_maintenance_event(
                vehicle.id,
                1_700_100_000,
                None,
                800.0,
                "bulbs; front left",
                "parts",
            )
            .await
            .expect("maintenance");
        store
            .add_insurance(vehicle.id, 1_735_000_000, 20_000.0, Some("AB-123"), None, None)
            .await
            .expect("insurance");
        store
            .upsert_recurring_item(vehicle.id, "brake pads", Some(25_000.0), None, Some(30_000.0), None)
            .await
            .expect("item");

        let csv = owner_csv(&store, "u1").await.expect("export");
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 5, "header plus one row per record");
        assert!(lines[0].starts_with("type;vehicle;date"));
        assert!(csv.contains("fuel;Skoda Octavia (2021)"));
        assert!(csv.contains("\"bulbs; front left\""), "semicolons are quoted");
        assert!(csv.contains("AB-123"));
        assert!(csv.contains("brake pads"));
    }

    #[test]
    fn quotes_are_doubled_inside_quoted_fields() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a;b"), "\"a;b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
