use std::collections::BTreeMap;

use once_cell::sync::Lazy;

/// Brand / model lookup backing the guided steps of vehicle registration.
/// Data is configuration, not behavior: unknown brands resolve to an empty
/// model list, which routes the flow to free-text entry.
static CATALOG: Lazy<BTreeMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    let entries: &[(&str, &[&str])] = &[
        ("Audi", &["A4", "A6", "Q5", "Q7", "TT"]),
        ("BMW", &["X5", "X3", "3 Series", "5 Series", "M5"]),
        ("Changan", &["CS35", "CS55", "CS75", "Uni-K", "Uni-T"]),
        ("Chery", &["Tiggo 4", "Tiggo 7", "Tiggo 8", "Arrizo 8"]),
        ("Chevrolet", &["Cruze", "Lacetti", "Niva", "Aveo", "Spark"]),
        ("Exeed", &["LX", "TXL", "VX", "RX"]),
        ("Ford", &["Focus", "Mondeo", "Kuga", "EcoSport", "Fiesta"]),
        ("Geely", &["Coolray", "Atlas", "Monjaro", "Emgrand", "Tugella"]),
        ("Haval", &["Jolion", "F7", "F7x", "Dargo", "H9"]),
        ("Hyundai", &["Solaris", "Creta", "Tucson", "Elantra", "Santa Fe"]),
        ("Jaecoo", &["J7"]),
        ("Kia", &["Rio", "Sportage", "Sorento", "Ceed", "Optima"]),
        ("Lada", &["Vesta", "Granta", "Niva", "Largus", "XRAY"]),
        ("Mazda", &["CX-5", "CX-9", "Mazda3", "Mazda6", "MX-5"]),
        ("Mercedes-Benz", &["E-Class", "S-Class", "GLC", "GLE", "A-Class"]),
        ("Mitsubishi", &["Outlander", "Pajero", "L200", "ASX", "Lancer"]),
        ("Nissan", &["Qashqai", "X-Trail", "Juke", "Almera", "Terrano"]),
        ("OMODA", &["C5"]),
        ("Renault", &["Logan", "Duster", "Sandero", "Kaptur", "Arkana"]),
        ("Skoda", &["Octavia", "Rapid", "Kodiaq", "Karoq", "Superb"]),
        ("Tank", &["300", "500", "700"]),
        ("Toyota", &["Camry", "Corolla", "RAV4", "Land Cruiser", "Yaris"]),
        ("Volkswagen", &["Golf", "Passat", "Tiguan", "Polo", "Jetta"]),
    ];
    entries.iter().copied().collect()
});

pub fn brands() -> Vec<&'static str> {
    CATALOG.keys().copied().collect()
}

pub fn models_for(brand: &str) -> &'static [&'static str] {
    CATALOG.get(brand).copied().unwrap_or(&[])
}

pub fn is_known_brand(brand: &str) -> bool {
    CATALOG.contains_key(brand)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_brand_lists_models() {
        let models = models_for("Toyota");
        assert!(models.contains(&"Camry"));
        assert!(is_known_brand("Toyota"));
    }

    #[test]
    fn unknown_brand_resolves_empty() {
        assert!(models_for("Tucker").is_empty());
        assert!(!is_known_brand("Tucker"));
    }

    #[test]
    fn brands_are_sorted_for_stable_menus() {
        let brands = brands();
        let mut sorted = brands.clone();
        sorted.sort();
        assert_eq!(brands, sorted);
        assert!(brands.len() >= 20);
    }
}
