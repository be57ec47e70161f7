use anyhow::{Context, Result};
use csv::WriterBuilder;
use duckdb::Connection;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    client::FhirClient,
    common::{ensure_parent_dir, replace_file, sql_escape_path, tmp_path_for},
    constants::NOT_AVAILABLE,
    extract::{language_text, normalize_zip5},
    fhir::{HealthcareService, Location, first_phone, reference_id},
    paginate::{PageStop, Paginator},
};

const LOCATION_SCHEMA: &[(&str, &str)] = &[
    ("id", "VARCHAR"),
    ("name", "VARCHAR"),
    ("address", "VARCHAR"),
    ("city", "VARCHAR"),
    ("zip", "VARCHAR"),
    ("latitude", "DOUBLE"),
    ("longitude", "DOUBLE"),
    ("status", "VARCHAR"),
];

const SERVICE_SCHEMA: &[(&str, &str)] = &[
    ("id", "VARCHAR"),
    ("location", "VARCHAR"),
    ("name", "VARCHAR"),
    ("specialty", "VARCHAR"),
    ("status", "VARCHAR"),
    ("phone", "VARCHAR"),
    ("language", "VARCHAR"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationRow {
    pub id: String,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub zip: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: Option<String>,
}

impl LocationRow {
    fn from_resource(location: &Location) -> Option<Self> {
        let id = location.id.clone()?;
        let name = location
            .name
            .clone()
            .or_else(|| location.identifier.first().and_then(|i| i.value.clone()))
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());
        let address = location.address.as_ref();
        let position = location.position.unwrap_or_default();
        Some(Self {
            id,
            name,
            address: address.and_then(|a| a.display_text()),
            city: address.and_then(|a| a.city.clone()),
            zip: address
                .and_then(|a| a.postal_code.as_deref())
                .and_then(normalize_zip5),
            latitude: position.latitude,
            longitude: position.longitude,
            status: location.status.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRow {
    pub id: String,
    pub location: Option<String>,
    pub name: Option<String>,
    pub specialty: String,
    pub status: Option<bool>,
    pub phone: Option<String>,
    pub language: Option<String>,
}

impl ServiceRow {
    fn from_resource(service: &HealthcareService) -> Option<Self> {
        let id = service.id.clone()?;
        let specialty = service
            .specialty
            .first()
            .and_then(|c| c.coding.first())
            .and_then(|c| c.display.clone())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());
        Some(Self {
            id,
            location: service
                .location
                .first()
                .and_then(|r| r.reference.as_deref())
                .map(|r| reference_id(r).to_string()),
            name: service.name.clone(),
            specialty,
            status: service.active,
            phone: first_phone(&service.telecom),
            language: service
                .language
                .as_ref()
                .map(language_text)
                .filter(|l| !l.is_empty()),
        })
    }
}

pub struct DirectorySearch<'a> {
    pub cities: &'a [String],
    pub specialties: &'a [String],
    pub state: &'a str,
    pub max_pages: Option<usize>,
}

pub struct DirectoryPaths {
    pub locations_csv: PathBuf,
    pub services_csv: PathBuf,
    pub output_csv: PathBuf,
}

#[derive(Debug, Default)]
pub struct DirectoryScrape {
    pub locations: usize,
    pub services: usize,
    pub merged_rows: u64,
    pub interrupted: bool,
    /// Fetch error that ended the crawl early. Rows read before it are still written.
    pub failure: Option<String>,
}

/// Rows read by one crawl, plus the error that cut it short.
#[derive(Debug)]
struct Crawl<T> {
    rows: Vec<T>,
    failure: Option<String>,
}

pub async fn scrape_directory(
    client: &FhirClient,
    search: &DirectorySearch<'_>,
    paths: &DirectoryPaths,
    shutdown: Arc<AtomicBool>,
) -> Result<DirectoryScrape> {
    let locations = crawl_locations(client, search, &shutdown).await?;
    tracing::info!(rows = locations.rows.len(), "finished Location crawl");
    let services = if locations.failure.is_some() {
        Crawl {
            rows: Vec::new(),
            failure: None,
        }
    } else {
        crawl_services(client, search, &shutdown).await?
    };
    tracing::info!(rows = services.rows.len(), "finished HealthcareService crawl");

    write_table(&paths.locations_csv, LOCATION_SCHEMA, &locations.rows)?;
    write_table(&paths.services_csv, SERVICE_SCHEMA, &services.rows)?;
    let merged_rows = merge_directory_tables(
        &paths.locations_csv,
        &paths.services_csv,
        &paths.output_csv,
    )?;

    Ok(DirectoryScrape {
        locations: locations.rows.len(),
        services: services.rows.len(),
        merged_rows,
        interrupted: shutdown.load(Ordering::SeqCst),
        failure: locations.failure.or(services.failure),
    })
}

async fn crawl_locations(
    client: &FhirClient,
    search: &DirectorySearch<'_>,
    shutdown: &Arc<AtomicBool>,
) -> Result<Crawl<LocationRow>> {
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    let mut failure = None;
    for city in search.cities.iter().map(String::as_str) {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let url = client.search_url(
            "Location",
            &[("address-city", city), ("address-state", search.state)],
        )?;
        let pages = Paginator::<Location>::new(client, url)
            .with_max_pages(search.max_pages)
            .with_next_suffix(client.carrier().next_link_suffix(search.state))
            .with_shutdown(Arc::clone(shutdown));
        let (locations, total, error) = collect_resources(pages).await;
        tracing::info!(city, total = total.unwrap_or_default(), "Location search");

        for location in &locations {
            match LocationRow::from_resource(location) {
                Some(row) if seen.insert(row.id.clone()) => rows.push(row),
                Some(_) => {}
                None => tracing::warn!(city, "Location without an id; skipping"),
            }
        }
        if let Some(err) = error {
            tracing::error!(
                city,
                error = %err,
                "Location crawl stopped early; keeping rows read so far"
            );
            failure = Some(format!("{err:#}"));
            break;
        }
    }
    Ok(Crawl { rows, failure })
}

/// HealthcareService search parameters, one set per query the carrier needs.
fn service_queries<'a>(
    client: &FhirClient,
    search: &'a DirectorySearch<'a>,
) -> Vec<Vec<(&'static str, &'a str)>> {
    let carrier = client.carrier();
    let scopes: Vec<Option<&'a str>> = if carrier.services_searchable_by_city() {
        search.cities.iter().map(|c| Some(c.as_str())).collect()
    } else {
        vec![None]
    };
    let specialties: Vec<Option<&'a str>> = if search.specialties.is_empty() {
        vec![None]
    } else {
        search.specialties.iter().map(|s| Some(s.as_str())).collect()
    };

    let mut queries = Vec::new();
    for city in &scopes {
        for specialty in &specialties {
            let mut params = Vec::new();
            if let Some(category) = carrier.service_category() {
                params.push(("service-category", category));
            }
            if let Some(city) = city {
                params.push(("location.address-city", *city));
            }
            params.push(("location.address-state", search.state));
            if let Some(specialty) = specialty {
                params.push(("specialty", *specialty));
            }
            queries.push(params);
        }
    }
    queries
}

async fn crawl_services(
    client: &FhirClient,
    search: &DirectorySearch<'_>,
    shutdown: &Arc<AtomicBool>,
) -> Result<Crawl<ServiceRow>> {
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    let mut failure = None;
    for params in service_queries(client, search) {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let url = client.search_url("HealthcareService", &params)?;
        let pages = Paginator::<HealthcareService>::new(client, url)
            .with_max_pages(search.max_pages)
            .with_shutdown(Arc::clone(shutdown));
        let (services, total, error) = collect_resources(pages).await;
        tracing::info!(?params, total = total.unwrap_or_default(), "HealthcareService search");

        for service in &services {
            match ServiceRow::from_resource(service) {
                Some(row) if seen.insert(row.id.clone()) => rows.push(row),
                Some(_) => {}
                None => tracing::warn!("HealthcareService without an id; skipping"),
            }
        }
        if let Some(err) = error {
            tracing::error!(
                ?params,
                error = %err,
                "HealthcareService crawl stopped early; keeping rows read so far"
            );
            failure = Some(format!("{err:#}"));
            break;
        }
    }
    Ok(Crawl { rows, failure })
}

/// Reads every page, keeping the resources fetched before any error.
async fn collect_resources<R: DeserializeOwned>(
    mut pages: Paginator<'_, R>,
) -> (Vec<R>, Option<u64>, Option<anyhow::Error>) {
    let mut resources = Vec::new();
    let error = loop {
        match pages.next_page().await {
            Ok(Some(bundle)) => resources.extend(bundle.into_resources()),
            Ok(None) => break None,
            Err(err) => break Some(err),
        }
    };
    if pages.stop_reason() == Some(PageStop::PageLimit) {
        tracing::info!(pages = pages.pages_fetched(), "page limit reached");
    }
    (resources, pages.total(), error)
}

fn write_table<T: Serialize>(path: &Path, schema: &[(&str, &str)], rows: &[T]) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp_path = tmp_path_for(path, "table.csv");
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(&tmp_path)
        .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
    writer
        .write_record(schema.iter().map(|(name, _)| *name))
        .with_context(|| format!("Failed writing header to {}", tmp_path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("Failed writing row to {}", tmp_path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed flushing {}", tmp_path.display()))?;
    replace_file(&tmp_path, path)
}

fn csv_source(path: &Path, schema: &[(&str, &str)]) -> String {
    let columns = schema
        .iter()
        .map(|(name, ty)| format!("'{name}': '{ty}'"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "read_csv('{}', header = true, auto_detect = false, columns = {{{columns}}})",
        sql_escape_path(path)
    )
}

/// Left-joins services onto their Location and writes the combined table. Returns the row count.
pub fn merge_directory_tables(
    locations_csv: &Path,
    services_csv: &Path,
    output_csv: &Path,
) -> Result<u64> {
    ensure_parent_dir(output_csv)?;
    let conn = Connection::open_in_memory().context("Failed opening DuckDB for directory merge")?;
    conn.execute_batch(&format!(
        "
        CREATE VIEW locations AS SELECT * FROM {};
        CREATE VIEW services AS SELECT * FROM {};
        CREATE VIEW directory AS
            SELECT
                s.id AS provider_id,
                s.location,
                s.name,
                s.specialty,
                s.status AS provider_status,
                s.phone,
                s.language,
                l.address,
                l.city,
                l.zip,
                l.latitude,
                l.longitude,
                l.status AS location_status
            FROM services AS s
            LEFT JOIN locations AS l ON s.location = l.id
            ORDER BY provider_id;
        ",
        csv_source(locations_csv, LOCATION_SCHEMA),
        csv_source(services_csv, SERVICE_SCHEMA),
    ))
    .context("Failed creating directory merge views")?;

    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM directory", [], |row| row.get(0))
        .context("Failed counting merged directory rows")?;

    let tmp_path = tmp_path_for(output_csv, "resource.csv");
    conn.execute_batch(&format!(
        "COPY (SELECT * FROM directory) TO '{}' (FORMAT CSV, HEADER)",
        sql_escape_path(&tmp_path)
    ))
    .with_context(|| format!("Failed writing {}", tmp_path.display()))?;
    replace_file(&tmp_path, output_csv)?;
    Ok(u64::try_from(rows).unwrap_or_default())
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
    use std::{collections::HashMap, time::Duration};

    fn client(server: &FakeServer, carrier: Carrier) -> FhirClient {
        FhirClient::new(
            Client::new(),
            carrier,
            Some(&server.base_url()),
            RateLimiter::per_second(0.0),
            RetryPolicy {
                max_retries: 1,
                initial_backoff: Duration::from_millis(1),
            },
        )
        .unwrap()
    }

    fn read_output(path: &Path) -> Vec<HashMap<String, String>> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader.deserialize().map(|row| row.unwrap()).collect()
    }

    #[test]
    fn location_name_falls_back_to_identifier() {
        let location: Location = serde_json::from_value(json!({
            "id": "l1",
            "identifier": [{"value": "Oakland Medical Center"}],
            "address": {"text": "3600 Broadway Oakland CA 94611", "city": "Oakland", "postalCode": "94611-5714"},
            "status": "active"
        }))
        .unwrap();
        let row = LocationRow::from_resource(&location).unwrap();
        assert_eq!(row.name, "Oakland Medical Center");
        assert_eq!(row.zip.as_deref(), Some("94611"));
        assert_eq!(row.latitude, None);

        let bare: Location = serde_json::from_value(json!({"id": "l2"})).unwrap();
        assert_eq!(LocationRow::from_resource(&bare).unwrap().name, "N/A");
    }

    #[test]
    fn service_rows_strip_location_prefix() {
        let service: HealthcareService = serde_json::from_value(json!({
            "id": "h1",
            "name": "Psychiatry",
            "active": true,
            "location": [{"reference": "Location/l1"}],
            "telecom": [{"system": "phone", "value": "510-555-0101"}],
            "language": ["English", "Spanish"]
        }))
        .unwrap();
        let row = ServiceRow::from_resource(&service).unwrap();
        assert_eq!(row.location.as_deref(), Some("l1"));
        assert_eq!(row.specialty, "N/A");
        assert_eq!(row.status, Some(true));
        assert_eq!(row.language.as_deref(), Some("English; Spanish"));
    }

    #[test]
    fn kaiser_services_are_queried_per_city_and_specialty() {
        let cities = vec!["Oakland".to_string(), "Dublin".to_string()];
        let specialties = vec!["Psychiatry".to_string()];
        let search = DirectorySearch {
            cities: &cities,
            specialties: &specialties,
            state: "CA",
            max_pages: None,
        };
        let kaiser = FhirClient::new(
            Client::new(),
            Carrier::Kaiser,
            None,
            RateLimiter::per_second(0.0),
            RetryPolicy::new(1),
        )
        .unwrap();
        let united = FhirClient::new(
            Client::new(),
            Carrier::United,
            None,
            RateLimiter::per_second(0.0),
            RetryPolicy::new(1),
        )
        .unwrap();

        let kaiser_queries = service_queries(&kaiser, &search);
        assert_eq!(kaiser_queries.len(), 2);
        assert_eq!(
            kaiser_queries[0],
            vec![
                ("location.address-city", "Oakland"),
                ("location.address-state", "CA"),
                ("specialty", "Psychiatry"),
            ]
        );

        let united_queries = service_queries(&united, &search);
        assert_eq!(
            united_queries,
            vec![vec![
                ("service-category", "prov"),
                ("location.address-state", "CA"),
                ("specialty", "Psychiatry"),
            ]]
        );
    }

    #[tokio::test]
    async fn crawl_joins_services_to_locations() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::start(vec![
            (
                "/Location",
                Reply::Json(json!({
                    "resourceType": "Bundle",
                    "total": 2,
                    "entry": [
                        {"resource": {"id": "l1", "name": "Oakland Medical Center", "status": "active",
                                      "address": {"text": "3600 Broadway Oakland CA 94611", "city": "Oakland", "postalCode": "94611"}}},
                        {"resource": {"id": "l1", "name": "Oakland Medical Center"}}
                    ]
                })),
            ),
            (
                "/HealthcareService",
                Reply::Json(json!({
                    "resourceType": "Bundle",
                    "total": 2,
                    "entry": [
                        {"resource": {"id": "h2", "name": "Dr. Lee", "active": true,
                                      "location": [{"reference": "Location/l1"}],
                                      "specialty": [{"coding": [{"display": "Psychiatry"}]}]}},
                        {"resource": {"id": "h1", "name": "Dr. Kim", "active": false,
                                      "location": [{"reference": "Location/elsewhere"}]}}
                    ]
                })),
            ),
        ])
        .await;
        let client = client(&server, Carrier::Kaiser);
        let cities = vec!["Oakland".to_string()];
        let specialties = vec!["Psychiatry".to_string()];
        let paths = DirectoryPaths {
            locations_csv: dir.path().join("kaiser_locations.csv"),
            services_csv: dir.path().join("kaiser_services.csv"),
            output_csv: dir.path().join("kaiser_resource.csv"),
        };

        let scrape = scrape_directory(
            &client,
            &DirectorySearch {
                cities: &cities,
                specialties: &specialties,
                state: "CA",
                max_pages: None,
            },
            &paths,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(scrape.locations, 1);
        assert_eq!(scrape.services, 2);
        assert_eq!(scrape.merged_rows, 2);
        assert!(!scrape.interrupted);

        let rows = read_output(&paths.output_csv);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["provider_id"], "h1");
        assert_eq!(rows[0]["specialty"], "N/A");
        assert_eq!(rows[0]["provider_status"], "false");
        assert_eq!(rows[0]["address"], "");
        assert_eq!(rows[1]["provider_id"], "h2");
        assert_eq!(rows[1]["name"], "Dr. Lee");
        assert_eq!(rows[1]["city"], "Oakland");
        assert_eq!(rows[1]["zip"], "94611");
        assert_eq!(rows[1]["location_status"], "active");
    }

    #[tokio::test]
    async fn failing_city_keeps_rows_already_crawled() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::start(vec![
            (
                "/Location?address-city=Oakland&address-state=CA&_count=100",
                Reply::Json(json!({
                    "resourceType": "Bundle",
                    "total": 1,
                    "entry": [{"resource": {"id": "l1", "name": "Oakland Medical Center",
                                            "address": {"city": "Oakland", "postalCode": "94611"}}}]
                })),
            ),
            (
                "/Location?address-city=Dublin&address-state=CA&_count=100",
                Reply::Status(503),
            ),
            (
                "/HealthcareService",
                Reply::Json(json!({"resourceType": "Bundle", "entry": []})),
            ),
        ])
        .await;
        let client = client(&server, Carrier::Kaiser);
        let cities = vec!["Oakland".to_string(), "Dublin".to_string()];
        let paths = DirectoryPaths {
            locations_csv: dir.path().join("kaiser_locations.csv"),
            services_csv: dir.path().join("kaiser_services.csv"),
            output_csv: dir.path().join("kaiser_resource.csv"),
        };

        let scrape = scrape_directory(
            &client,
            &DirectorySearch {
                cities: &cities,
                specialties: &[],
                state: "CA",
                max_pages: None,
            },
            &paths,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(scrape.locations, 1);
        assert_eq!(scrape.services, 0);
        assert!(scrape.failure.unwrap().contains("503"));
        assert_eq!(server.hits("/HealthcareService"), 0);

        let locations = read_output(&paths.locations_csv);
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0]["id"], "l1");
        assert_eq!(locations[0]["zip"], "94611");
        assert!(paths.services_csv.exists());
        assert!(read_output(&paths.output_csv).is_empty());
    }
}
