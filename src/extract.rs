use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::{
    carrier::Carrier,
    constants::{NOT_ACCEPTING_PATIENTS, NOT_LISTED, UNRECOGNIZED_NETWORK},
    fhir::{HealthcareService, PractitionerRole},
};

pub fn role_service_reference(role: &PractitionerRole) -> Option<&str> {
    role.healthcare_service
        .first()
        .and_then(|r| r.reference.as_deref())
}

pub fn role_location_reference(role: &PractitionerRole) -> Option<&str> {
    role.location.first().and_then(|r| r.reference.as_deref())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specialty {
    pub code: String,
    pub display: String,
}

/// Taxonomy code and display of the first specialty coding.
pub fn specialty_of(service: Option<&HealthcareService>) -> Specialty {
    let coding = service
        .and_then(|s| s.specialty.first())
        .and_then(|c| c.coding.first());
    match coding {
        Some(coding) => Specialty {
            code: coding.code.clone().unwrap_or_else(|| NOT_LISTED.to_string()),
            display: coding
                .display
                .clone()
                .unwrap_or_else(|| NOT_LISTED.to_string()),
        },
        None => Specialty {
            code: NOT_LISTED.to_string(),
            display: NOT_LISTED.to_string(),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkStatus {
    Listed(Vec<String>),
    NotAccepting,
    Unrecognized(Vec<String>),
}

impl NetworkStatus {
    pub fn display(&self) -> String {
        match self {
            NetworkStatus::Listed(names) => names.join("; "),
            NetworkStatus::NotAccepting => NOT_ACCEPTING_PATIENTS.to_string(),
            NetworkStatus::Unrecognized(_) => UNRECOGNIZED_NETWORK.to_string(),
        }
    }
}

/// Networks a role participates in, read from extensions that carry a network identifier.
pub fn network_status(role: &PractitionerRole, carrier: Carrier) -> NetworkStatus {
    let codes: Vec<&str> = role
        .extension
        .iter()
        .filter_map(|ext| ext.value_reference.as_ref())
        .filter_map(|r| r.identifier.as_ref())
        .filter_map(|id| id.value.as_deref())
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .collect();

    if codes.is_empty() {
        return NetworkStatus::NotAccepting;
    }

    let mut names = Vec::with_capacity(codes.len());
    for code in &codes {
        match carrier.network_name(code) {
            Some(name) => {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            None => {
                return NetworkStatus::Unrecognized(
                    codes.iter().map(|c| (*c).to_string()).collect(),
                );
            }
        }
    }
    NetworkStatus::Listed(names)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFlag {
    Epo,
    Hmo,
    MediCal,
    Pos,
    Medicare,
}

impl NetworkFlag {
    pub const ALL: [NetworkFlag; 5] = [
        NetworkFlag::Epo,
        NetworkFlag::Hmo,
        NetworkFlag::MediCal,
        NetworkFlag::Pos,
        NetworkFlag::Medicare,
    ];

    fn token(self) -> &'static str {
        match self {
            NetworkFlag::Epo => "EPO",
            NetworkFlag::Hmo => "HMO",
            NetworkFlag::MediCal => "Medi-Cal",
            NetworkFlag::Pos => "Point-of-Service",
            NetworkFlag::Medicare => "Senior Advantage",
        }
    }

    pub fn is_member(self, networks: &str) -> u8 {
        u8::from(networks.contains(self.token()))
    }
}

/// Strips floor/suite/unit/room designators that make Nominatim miss.
pub fn clean_address(address: &str) -> String {
    static UNIT_DESIGNATOR: OnceLock<Regex> = OnceLock::new();
    let unit_re = UNIT_DESIGNATOR.get_or_init(|| {
        Regex::new(r"\b(?:Fl|Ste|Unit|Rm)\s\w+\s").expect("Invalid unit designator regex")
    });
    let stripped = unit_re.replace_all(address, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `("CA", "94568")` from `"5601 Arnold Rd Dublin CA 94568"`.
pub fn extract_state_zip(address: &str) -> Option<(String, String)> {
    static TRAILING_STATE_ZIP: OnceLock<Regex> = OnceLock::new();
    let state_zip_re = TRAILING_STATE_ZIP.get_or_init(|| {
        Regex::new(r"(\w{2})\s(\d{5})(?:-\d{4})?$").expect("Invalid state/zip regex")
    });
    let caps = state_zip_re.captures(address.trim())?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

pub fn normalize_zip5(s: &str) -> Option<String> {
    let mut digits = String::with_capacity(5);
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 5 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.len() == 5 { Some(digits) } else { None }
}

pub fn language_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(language_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    }
}

/// Flattens nested objects into dotted column names. Arrays stay as compact JSON text.
pub fn flatten_json(value: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into(value, "", &mut out);
    out
}

fn flatten_into(value: &Value, prefix: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            if map.is_empty() && !prefix.is_empty() {
                out.push((prefix.to_string(), String::new()));
            }
            for (key, child) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(child, &name, out);
            }
        }
        Value::Null => out.push((prefix.to_string(), String::new())),
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        Value::Array(_) | Value::Bool(_) | Value::Number(_) => {
            out.push((prefix.to_string(), value.to_string()))
        }
    }
}
