diesel::table! {
    vehicles (id) {
        id -> Integer,
        owner_id -> Text,
        brand -> Text,
        model -> Text,
        year -> Integer,
        nickname -> Nullable<Text>,
        odometer_km -> Double,
        fuel_type -> Text,
        active -> Bool,
        created_at -> BigInt,
        last_service_odometer -> Nullable<Double>,
        last_service_date -> Nullable<BigInt>,
        service_interval_km -> Nullable<Double>,
        service_interval_months -> Nullable<Integer>,
    }
}

diesel::table! {
    recurring_items (id) {
        id -> Integer,
        vehicle_id -> Integer,
        name -> Text,
        last_odometer -> Nullable<Double>,
        last_date -> Nullable<BigInt>,
        interval_km -> Nullable<Double>,
        interval_months -> Nullable<Integer>,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}

diesel::table! {
    insurance_policies (id) {
        id -> Integer,
        vehicle_id -> Integer,
        end_date -> BigInt,
        cost -> Double,
        policy_number -> Nullable<Text>,
        company -> Nullable<Text>,
        notes -> Nullable<Text>,
        created_at -> BigInt,
    }
}

diesel::table! {
    fuel_events (id) {
        id -> Integer,
        vehicle_id -> Integer,
        occurred_at -> BigInt,
        odometer_km -> Nullable<Double>,
        liters -> Double,
        cost -> Double,
        fuel_type -> Nullable<Text>,
    }
}

diesel::table! {
    maintenance_events (id) {
        id -> Integer,
        vehicle_id -> Integer,
        occurred_at -> BigInt,
        odometer_km -> Nullable<Double>,
        cost -> Double,
        description -> Text,
        category -> Text,
    }
}

diesel::table! {
    threshold_flags (id) {
        id -> Integer,
        subject_kind -> Text,
        subject_id -> Integer,
        kind -> Text,
        fired_at -> BigInt,
    }
}
