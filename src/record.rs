use serde::{Deserialize, Serialize};

use crate::extract::NetworkFlag;

/// One denormalized provider listing, as written to `providers.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "Address")]
    pub address: Option<String>,
    #[serde(rename = "Phone Number")]
    pub phone: Option<String>,
    #[serde(rename = "Latitude")]
    pub latitude: Option<f64>,
    #[serde(rename = "Longitude")]
    pub longitude: Option<f64>,
    #[serde(rename = "Provider Taxonomy Code")]
    pub taxonomy_code: String,
    #[serde(rename = "Specialty")]
    pub specialty: String,
    #[serde(rename = "Networks")]
    pub networks: String,
    #[serde(rename = "Last Updated")]
    pub last_updated: Option<String>,
    #[serde(rename = "Kaiser EPO Network")]
    pub epo_network: u8,
    #[serde(rename = "Kaiser HMO Network")]
    pub hmo_network: u8,
    #[serde(rename = "Kaiser Medi-Cal Network")]
    pub medi_cal_network: u8,
    #[serde(rename = "Kaiser Point-of-Service Network")]
    pub pos_network: u8,
    #[serde(rename = "Kaiser Senior Advantage Network")]
    pub senior_advantage_network: u8,
    #[serde(rename = "City")]
    pub city: Option<String>,
    #[serde(rename = "State")]
    pub state: Option<String>,
    #[serde(rename = "Zip Code")]
    pub zip_code: Option<String>,
    #[serde(rename = "Carrier")]
    pub carrier: Option<String>,
    #[serde(rename = "Accepting Patients")]
    pub accepting_patients: u8,
}

impl ProviderRecord {
    pub fn set_network_flags(&mut self) {
        let networks = self.networks.as_str();
        for flag in NetworkFlag::ALL {
            let member = flag.is_member(networks);
            match flag {
                NetworkFlag::Epo => self.epo_network = member,
                NetworkFlag::Hmo => self.hmo_network = member,
                NetworkFlag::MediCal => self.medi_cal_network = member,
                NetworkFlag::Pos => self.pos_network = member,
                NetworkFlag::Medicare => self.senior_advantage_network = member,
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_record(id: &str, name: &str) -> ProviderRecord {
    ProviderRecord {
        id: id.to_string(),
        name: Some(name.to_string()),
        address: Some("5601 Arnold Rd Dublin CA 94568".to_string()),
        phone: Some("925-555-0100".to_string()),
        latitude: Some(37.70),
        longitude: Some(-121.93),
        taxonomy_code: "101YM0800X".to_string(),
        specialty: "Mental Health Counselor".to_string(),
        networks: "Kaiser HMO Network".to_string(),
        last_updated: Some("2022-03-01T00:00:00Z".to_string()),
        epo_network: 0,
        hmo_network: 1,
        medi_cal_network: 0,
        pos_network: 0,
        senior_advantage_network: 0,
        city: Some("Dublin".to_string()),
        state: Some("CA".to_string()),
        zip_code: Some("94568".to_string()),
        carrier: Some("Kaiser".to_string()),
        accepting_patients: 1,
    }
}
