use clap::ValueEnum;
use std::fmt;

use crate::constants::{
    ANTHEM_FHIR_BASE_URL, KAISER_FHIR_BASE_URL, KAISER_NETWORKS, KNOWN_CARRIERS,
    UNITED_FHIR_BASE_URL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Carrier {
    Kaiser,
    #[value(alias = "uhc")]
    United,
    Anthem,
}

impl Carrier {
    pub fn base_url(self) -> &'static str {
        match self {
            Carrier::Kaiser => KAISER_FHIR_BASE_URL,
            Carrier::United => UNITED_FHIR_BASE_URL,
            Carrier::Anthem => ANTHEM_FHIR_BASE_URL,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Carrier::Kaiser => "Kaiser",
            Carrier::United => "UnitedHealthcare",
            Carrier::Anthem => "Anthem",
        }
    }

    /// Short name used in output file names.
    pub fn slug(self) -> &'static str {
        match self {
            Carrier::Kaiser => "kaiser",
            Carrier::United => "uhc",
            Carrier::Anthem => "anthem",
        }
    }

    pub fn code(self) -> &'static str {
        carrier_code(self.display_name())
    }

    /// Page-size parameter for a search. Kaiser's PractitionerRole endpoint takes none.
    pub fn page_size_param(self, resource_type: &str) -> Option<(&'static str, &'static str)> {
        match self {
            Carrier::Kaiser if resource_type == "PractitionerRole" => None,
            Carrier::Kaiser | Carrier::United | Carrier::Anthem => Some(("_count", "100")),
        }
    }

    /// Anthem's `next` links lose the state filter, so it is appended again.
    pub fn next_link_suffix(self, state: &str) -> Option<String> {
        match self {
            Carrier::Anthem => Some(format!("&address-state={state}")),
            Carrier::Kaiser | Carrier::United => None,
        }
    }

    /// Kaiser's HealthcareService endpoint accepts a location city filter.
    pub fn services_searchable_by_city(self) -> bool {
        matches!(self, Carrier::Kaiser)
    }

    /// Optum only answers HealthcareService searches scoped to a service category.
    pub fn service_category(self) -> Option<&'static str> {
        match self {
            Carrier::United => Some("prov"),
            Carrier::Kaiser | Carrier::Anthem => None,
        }
    }

    pub fn network_catalog(self) -> Option<&'static [(&'static str, &'static str)]> {
        match self {
            Carrier::Kaiser => Some(KAISER_NETWORKS),
            Carrier::United | Carrier::Anthem => None,
        }
    }

    /// Translates a raw network code. Carriers without a catalog pass the code through.
    pub fn network_name(self, code: &str) -> Option<String> {
        match self.network_catalog() {
            Some(catalog) => catalog
                .iter()
                .find(|(raw, _)| *raw == code)
                .map(|(_, name)| (*name).to_string()),
            None => Some(code.to_string()),
        }
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// First known carrier whose name appears in the network listing.
pub fn attribute_carrier(networks: &str) -> Option<&'static str> {
    KNOWN_CARRIERS
        .iter()
        .find(|(name, _)| networks.contains(name))
        .map(|(name, _)| *name)
}

pub fn carrier_code(carrier: &str) -> &'static str {
    KNOWN_CARRIERS
        .iter()
        .find(|(name, _)| *name == carrier)
        .map(|(_, code)| *code)
        .unwrap_or("XX")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kaiser_codes_translate_through_catalog() {
        assert_eq!(
            Carrier::Kaiser.network_name("HMO_CN").as_deref(),
            Some("Kaiser HMO Network")
        );
        assert_eq!(Carrier::Kaiser.network_name("PPO_XYZ"), None);
        assert_eq!(
            Carrier::United.network_name("PPO_XYZ").as_deref(),
            Some("PPO_XYZ")
        );
    }

    #[test]
    fn attribution_prefers_earlier_carriers() {
        assert_eq!(
            attribute_carrier("Kaiser HMO Network; Kaiser EPO Network"),
            Some("Kaiser")
        );
        assert_eq!(attribute_carrier("Anthem Blue Shield PPO"), Some("Anthem"));
        assert_eq!(attribute_carrier("Not accepting patients"), None);
    }

    #[test]
    fn unknown_carrier_code_is_xx() {
        assert_eq!(Carrier::Kaiser.code(), "KP");
        assert_eq!(Carrier::United.code(), "UN");
        assert_eq!(Carrier::Anthem.code(), "AN");
        assert_eq!(carrier_code("Humana"), "XX");
    }

    #[test]
    fn uhc_alias_parses() {
        assert_eq!(Carrier::from_str("uhc", true), Ok(Carrier::United));
        assert_eq!(Carrier::from_str("KAISER", true), Ok(Carrier::Kaiser));
    }

    #[test]
    fn anthem_next_links_get_state_suffix() {
        assert_eq!(
            Carrier::Anthem.next_link_suffix("CA").as_deref(),
            Some("&address-state=CA")
        );
        assert_eq!(Carrier::United.next_link_suffix("CA"), None);
    }
}
