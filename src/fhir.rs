//! The slice of FHIR R4 the carrier directories expose. Every field is optional because
//! each carrier populates a different subset.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct Bundle<R> {
    pub total: Option<u64>,
    #[serde(default)]
    pub link: Vec<BundleLink>,
    #[serde(default = "Vec::new")]
    pub entry: Vec<BundleEntry<R>>,
}

impl<R> Bundle<R> {
    pub fn next_link(&self) -> Option<&str> {
        self.link
            .iter()
            .find(|link| link.relation == "next")
            .map(|link| link.url.as_str())
            .filter(|url| !url.trim().is_empty())
    }

    pub fn into_resources(self) -> impl Iterator<Item = R> {
        self.entry.into_iter().filter_map(|entry| entry.resource)
    }
}

#[derive(Debug, Deserialize)]
pub struct BundleLink {
    pub relation: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct BundleEntry<R> {
    #[serde(rename = "fullUrl")]
    pub full_url: Option<String>,
    pub resource: Option<R>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Reference {
    pub reference: Option<String>,
    pub display: Option<String>,
    pub identifier: Option<Identifier>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Identifier {
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Meta {
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Extension {
    #[serde(rename = "valueReference")]
    pub value_reference: Option<Reference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Coding {
    pub code: Option<String>,
    pub display: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeableConcept {
    #[serde(default)]
    pub coding: Vec<Coding>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactPoint {
    pub system: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Address {
    pub text: Option<String>,
    #[serde(default)]
    pub line: Vec<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    #[serde(rename = "postalCode")]
    pub postal_code: Option<String>,
}

impl Address {
    /// `text` when present, otherwise the structured parts joined the way the
    /// carriers format `text` ("5601 Arnold Rd Dublin CA 94568").
    pub fn display_text(&self) -> Option<String> {
        if let Some(text) = self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            return Some(text.to_string());
        }
        let parts: Vec<&str> = self
            .line
            .iter()
            .map(String::as_str)
            .chain(self.city.as_deref())
            .chain(self.state.as_deref())
            .chain(self.postal_code.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Position {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PractitionerRole {
    pub id: Option<String>,
    pub meta: Option<Meta>,
    pub practitioner: Option<Reference>,
    #[serde(default)]
    pub location: Vec<Reference>,
    #[serde(default, rename = "healthcareService")]
    pub healthcare_service: Vec<Reference>,
    #[serde(default)]
    pub extension: Vec<Extension>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthcareService {
    pub id: Option<String>,
    pub name: Option<String>,
    pub active: Option<bool>,
    #[serde(default)]
    pub specialty: Vec<CodeableConcept>,
    #[serde(default)]
    pub telecom: Vec<ContactPoint>,
    #[serde(default)]
    pub location: Vec<Reference>,
    /// Kaiser-only, not part of R4; shape varies between string and list.
    pub language: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Location {
    pub id: Option<String>,
    pub name: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub identifier: Vec<Identifier>,
    pub address: Option<Address>,
    #[serde(default)]
    pub telecom: Vec<ContactPoint>,
    pub position: Option<Position>,
}

pub fn reference_id(reference: &str) -> &str {
    reference
        .trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(reference)
}

/// First phone number, or the first contact value when no entry declares a system.
pub fn first_phone(telecom: &[ContactPoint]) -> Option<String> {
    telecom
        .iter()
        .find(|c| c.system.as_deref() == Some("phone") && c.value.is_some())
        .or_else(|| telecom.iter().find(|c| c.value.is_some()))
        .and_then(|c| c.value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn next_link_is_found_by_relation_not_position() {
        let bundle: Bundle<Value> = serde_json::from_value(json!({
            "resourceType": "Bundle",
            "total": 3,
            "link": [
                {"relation": "next", "url": "https://fhir.test/page2"},
                {"relation": "self", "url": "https://fhir.test/page1"}
            ],
            "entry": []
        }))
        .unwrap();
        assert_eq!(bundle.next_link(), Some("https://fhir.test/page2"));
        assert_eq!(bundle.total, Some(3));
    }

    #[test]
    fn missing_entry_and_link_deserialize_empty() {
        let bundle: Bundle<Location> =
            serde_json::from_value(json!({"resourceType": "Bundle", "total": 0})).unwrap();
        assert!(bundle.entry.is_empty());
        assert!(bundle.next_link().is_none());
    }

    #[test]
    fn practitioner_role_reads_camel_case_fields() {
        let role: PractitionerRole = serde_json::from_value(json!({
            "resourceType": "PractitionerRole",
            "id": "role-1",
            "meta": {"lastUpdated": "2022-03-01T00:00:00Z"},
            "healthcareService": [{"reference": "HealthcareService/hs-1"}],
            "location": [{"reference": "Location/loc-1"}],
            "extension": [
                {"url": "http://x/ext/new-patients"},
                {"url": "http://x/ext/network", "valueReference": {"identifier": {"value": "HMO_CN"}}}
            ]
        }))
        .unwrap();
        assert_eq!(role.healthcare_service.len(), 1);
        assert_eq!(
            role.meta.and_then(|m| m.last_updated).as_deref(),
            Some("2022-03-01T00:00:00Z")
        );
        assert_eq!(role.extension.len(), 2);
    }

    #[test]
    fn reference_id_strips_resource_type() {
        assert_eq!(reference_id("Location/abc-123"), "abc-123");
        assert_eq!(reference_id("https://fhir.test/R4/Location/9"), "9");
        assert_eq!(reference_id("plain"), "plain");
    }

    #[test]
    fn address_text_falls_back_to_parts() {
        let address = Address {
            line: vec!["5601 Arnold Rd".into()],
            city: Some("Dublin".into()),
            state: Some("CA".into()),
            postal_code: Some("94568".into()),
            ..Address::default()
        };
        assert_eq!(
            address.display_text().as_deref(),
            Some("5601 Arnold Rd Dublin CA 94568")
        );
    }

    #[test]
    fn first_phone_prefers_phone_system() {
        let telecom = vec![
            ContactPoint {
                system: Some("fax".into()),
                value: Some("555-0000".into()),
            },
            ContactPoint {
                system: Some("phone".into()),
                value: Some("555-1234".into()),
            },
        ];
        assert_eq!(first_phone(&telecom).as_deref(), Some("555-1234"));
        assert_eq!(first_phone(&[]), None);
    }
}
