//! Address parsing and component-weighted comparison.
//!
//! Addresses are split into {number, street, type, city, region, postal}
//! components. Component weights are fixed; a component missing on both
//! sides contributes to neither numerator nor denominator.

use std::collections::HashMap;

/// Parsed address components. Every component is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressComponents {
    pub number: Option<String>,
    pub street: Option<String>,
    pub street_type: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub postal: Option<String>,
}

const STREET_TYPES: &[(&str, &str)] = &[
    ("street", "st"),
    ("st", "st"),
    ("avenue", "ave"),
    ("ave", "ave"),
    ("av", "ave"),
    ("road", "rd"),
    ("rd", "rd"),
    ("boulevard", "blvd"),
    ("blvd", "blvd"),
    ("drive", "dr"),
    ("dr", "dr"),
    ("lane", "ln"),
    ("ln", "ln"),
    ("court", "ct"),
    ("ct", "ct"),
    ("place", "pl"),
    ("pl", "pl"),
    ("way", "way"),
    ("terrace", "ter"),
    ("ter", "ter"),
    ("circle", "cir"),
    ("cir", "cir"),
    ("highway", "hwy"),
    ("hwy", "hwy"),
];

fn canonical_street_type(token: &str) -> Option<&'static str> {
    let lowered = token.to_lowercase();
    let stripped = lowered.trim_end_matches('.');
    STREET_TYPES
        .iter()
        .find(|(name, _)| *name == stripped)
        .map(|(_, canon)| *canon)
}

fn looks_like_postal(token: &str) -> bool {
    let t = token.trim();
    t.len() >= 4 && t.len() <= 10 && t.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && t.chars().filter(|c| c.is_ascii_digit()).count() * 2 >= t.len()
}

/// Parse a free-form address string.
///
/// Comma-separated layout is assumed: the first segment carries number,
/// street, and type; the last segment may carry region and postal code;
/// anything between is the city.
pub fn parse_address(raw: &str) -> AddressComponents {
    let mut components = AddressComponents::default();
    let segments: Vec<&str> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if segments.is_empty() {
        return components;
    }

    // First segment: [number] street... [type]
    let mut tokens: Vec<String> = segments[0]
        .split_whitespace()
        .map(|t| t.to_string())
        .collect();
    if let Some(first) = tokens.first() {
        if first.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            components.number = Some(
                first
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .collect::<String>()
                    .to_lowercase(),
            );
            tokens.remove(0);
        }
    }
    if let Some(last) = tokens.last() {
        if let Some(canon) = canonical_street_type(last) {
            components.street_type = Some(canon.to_string());
            tokens.pop();
        }
    }
    if !tokens.is_empty() {
        components.street = Some(tokens.join(" ").to_lowercase());
    }

    if segments.len() >= 2 {
        // Last segment: region and/or postal code, e.g. "IL 62704".
        let last_tokens: Vec<&str> = segments[segments.len() - 1].split_whitespace().collect();
        let mut region_tokens = Vec::new();
        for token in &last_tokens {
            if looks_like_postal(token) && components.postal.is_none() {
                components.postal = Some(token.to_lowercase());
            } else {
                region_tokens.push(token.to_lowercase());
            }
        }
        if !region_tokens.is_empty() {
            components.region = Some(region_tokens.join(" "));
        }

        let city_segments = &segments[1..segments.len() - 1];
        if !city_segments.is_empty() {
            components.city = Some(city_segments.join(" ").to_lowercase());
        } else if components.region.is_some() && segments.len() == 2 && components.postal.is_none()
        {
            // "123 Main St, Springfield": the tail is a city, not a region.
            components.city = components.region.take();
        }
    }

    components
}

/// Weighted component comparison. Number and postal compare exactly; the
/// rest use Jaro-Winkler.
pub fn compare_addresses(left: &str, right: &str) -> f64 {
    let a = parse_address(left);
    let b = parse_address(right);

    let mut weights: HashMap<&str, (f64, bool)> = HashMap::new();
    weights.insert("number", (0.25, true));
    weights.insert("street", (0.35, false));
    weights.insert("type", (0.15, false));
    weights.insert("city", (0.15, false));
    weights.insert("region", (0.05, false));
    weights.insert("postal", (0.05, true));

    let pairs: [(&str, &Option<String>, &Option<String>); 6] = [
        ("number", &a.number, &b.number),
        ("street", &a.street, &b.street),
        ("type", &a.street_type, &b.street_type),
        ("city", &a.city, &b.city),
        ("region", &a.region, &b.region),
        ("postal", &a.postal, &b.postal),
    ];

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (name, left_value, right_value) in pairs {
        let (weight, exact) = weights[name];
        match (left_value, right_value) {
            (None, None) => {} // absent on both sides: out of the score entirely
            (Some(l), Some(r)) => {
                let score = if exact {
                    if l == r {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    strsim::jaro_winkler(l, r)
                };
                numerator += weight * score;
                denominator += weight;
            }
            _ => {
                denominator += weight;
            }
        }
    }

    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}
