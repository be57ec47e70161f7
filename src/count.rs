use anyhow::{Result, bail};
use serde_json::Value;

use crate::{client::FhirClient, fhir::Bundle};

/// Number of PractitionerRole entries the carrier reports for one city.
pub async fn count_practitioner_roles(client: &FhirClient, city: &str, state: &str) -> Result<u64> {
    let url = client.search_url(
        "PractitionerRole",
        &[
            ("location.address-city", city),
            ("location.address-state", state),
        ],
    )?;
    let bundle: Bundle<Value> = client.get_json(url.as_str()).await?;
    match bundle.total {
        Some(total) => Ok(total),
        None => bail!("{} did not report a total for {city}, {state}", client.carrier()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        carrier::Carrier,
        client::{RateLimiter, RetryPolicy},
        test_server::{FakeServer, Reply},
    };
    use reqwest::Client;
    use serde_json::json;

    #[tokio::test]
    async fn reports_bundle_total() {
        let server = FakeServer::start(vec![
            (
                "/PractitionerRole?location.address-city=Dublin&location.address-state=CA",
                Reply::Json(json!({"resourceType": "Bundle", "total": 412, "entry": []})),
            ),
            (
                "/PractitionerRole",
                Reply::Json(json!({"resourceType": "Bundle", "entry": []})),
            ),
        ])
        .await;
        let client = FhirClient::new(
            Client::new(),
            Carrier::Kaiser,
            Some(&server.base_url()),
            RateLimiter::per_second(0.0),
            RetryPolicy::new(1),
        )
        .unwrap();

        assert_eq!(
            count_practitioner_roles(&client, "Dublin", "CA").await.unwrap(),
            412
        );
        let err = count_practitioner_roles(&client, "Nowhere", "CA")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not report a total"));
    }
}
