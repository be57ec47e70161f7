use anyhow::{Context, Result};
use csv::Writer;
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, atomic::AtomicBool},
};

use crate::{
    client::FhirClient,
    common::{ensure_parent_dir, replace_file, tmp_path_for},
    extract::flatten_json,
    paginate::{PageStop, Paginator},
};

const PROGRESS_EVERY_PAGES: usize = 100;

/// Rows of flattened JSON whose columns are the union of every key seen, in first-seen order.
#[derive(Debug, Default)]
pub struct FlatTable {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<String>>,
}

impl FlatTable {
    pub fn push(&mut self, fields: Vec<(String, String)>) {
        let mut row = vec![String::new(); self.columns.len()];
        for (key, value) in fields {
            let slot = match self.index.get(&key) {
                Some(&slot) => slot,
                None => {
                    let slot = self.columns.len();
                    self.index.insert(key.clone(), slot);
                    self.columns.push(key);
                    row.push(String::new());
                    slot
                }
            };
            row[slot] = value;
        }
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        ensure_parent_dir(path)?;
        let tmp_path = tmp_path_for(path, "providers.csv");
        let mut writer = Writer::from_path(&tmp_path)
            .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
        writer
            .write_record(&self.columns)
            .context("Failed writing bulk CSV header")?;
        let width = self.columns.len();
        for row in &self.rows {
            // Rows pushed before a later column appeared are short.
            let padding = std::iter::repeat_n("", width - row.len());
            writer
                .write_record(row.iter().map(String::as_str).chain(padding))
                .context("Failed writing bulk CSV row")?;
        }
        writer.flush().context("Failed flushing bulk CSV")?;
        replace_file(&tmp_path, path)
    }
}

#[derive(Debug)]
pub struct BulkDump {
    pub rows: usize,
    pub columns: usize,
    pub pages: usize,
    pub stop: Option<PageStop>,
    /// Fetch error that ended the crawl early. Rows read before it are still written.
    pub failure: Option<String>,
}

/// Pages through every Location in `state` and writes them flattened to `output`.
pub async fn dump_locations(
    client: &FhirClient,
    state: &str,
    max_pages: Option<usize>,
    output: &Path,
    shutdown: Arc<AtomicBool>,
) -> Result<BulkDump> {
    let url = client.search_url("Location", &[("address-state", state)])?;
    let mut pages = Paginator::<Value>::new(client, url)
        .with_max_pages(max_pages)
        .with_next_suffix(client.carrier().next_link_suffix(state))
        .with_shutdown(shutdown);

    let mut table = FlatTable::default();
    let mut failure = None;
    loop {
        let bundle = match pages.next_page().await {
            Ok(Some(bundle)) => bundle,
            Ok(None) => break,
            Err(err) => {
                tracing::error!(
                    pages = pages.pages_fetched(),
                    error = %err,
                    "Location crawl stopped early; keeping rows read so far"
                );
                failure = Some(format!("{err:#}"));
                break;
            }
        };
        if pages.pages_fetched() == 1 {
            tracing::info!(
                carrier = %client.carrier(),
                state,
                total = pages.total().unwrap_or_default(),
                "initial request successful; this will take a while"
            );
        }
        for entry in bundle.entry {
            table.push(flatten_json(&json!({
                "fullUrl": entry.full_url,
                "resource": entry.resource,
            })));
        }
        if pages.pages_fetched() % PROGRESS_EVERY_PAGES == 0 {
            tracing::info!(pages = pages.pages_fetched(), rows = table.len(), "completed");
        }
    }

    if table.is_empty() {
        tracing::warn!(state, "no Location entries returned");
    }
    table.write_csv(output)?;
    Ok(BulkDump {
        rows: table.len(),
        columns: table.columns().len(),
        pages: pages.pages_fetched(),
        stop: pages.stop_reason(),
        failure,
    })
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
    use std::time::Duration;

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

    fn read_rows(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let headers = reader.headers().unwrap().iter().map(String::from).collect();
        let rows = reader
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect();
        (headers, rows)
    }

    #[test]
    fn later_columns_pad_earlier_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.csv");
        let mut table = FlatTable::default();
        table.push(vec![("a".into(), "1".into())]);
        table.push(vec![("b".into(), "2".into()), ("a".into(), "3".into())]);
        table.write_csv(&path).unwrap();

        let (headers, rows) = read_rows(&path);
        assert_eq!(headers, ["a", "b"]);
        assert_eq!(rows, [vec!["1", ""], vec!["3", "2"]]);
    }

    #[tokio::test]
    async fn dumps_every_page_and_keeps_partial_rows_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("ca_uhc_providers.csv");
        let server = FakeServer::start(vec![
            (
                "/Location",
                Reply::Json(json!({
                    "resourceType": "Bundle",
                    "total": 3,
                    "link": [{"relation": "next", "url": "{base}/Location/p2"}],
                    "entry": [
                        {"fullUrl": "{base}/Location/1", "resource": {"id": "1", "name": "Clinic A",
                            "position": {"latitude": 37.8, "longitude": -122.27}}},
                        {"fullUrl": "{base}/Location/2", "resource": {"id": "2", "name": "Clinic B"}}
                    ]
                })),
            ),
            ("/Location/p2", Reply::Status(500)),
        ])
        .await;
        let client = client(&server, Carrier::United);

        let dump = dump_locations(
            &client,
            "CA",
            None,
            &output,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(dump.rows, 2);
        assert_eq!(dump.pages, 1);
        assert!(dump.failure.is_some());

        let (headers, rows) = read_rows(&output);
        assert!(headers.contains(&"resource.position.latitude".to_string()));
        let id_col = headers.iter().position(|h| h == "resource.id").unwrap();
        let name_col = headers.iter().position(|h| h == "resource.name").unwrap();
        let lat_col = headers
            .iter()
            .position(|h| h == "resource.position.latitude")
            .unwrap();
        assert_eq!(rows[0][id_col], "1");
        assert_eq!(rows[0][lat_col], "37.8");
        assert_eq!(rows[1][name_col], "Clinic B");
        assert_eq!(rows[1][lat_col], "");
    }

    #[tokio::test]
    async fn page_bound_limits_the_dump() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("ca_anthem_providers.csv");
        let server = FakeServer::start(vec![(
            "/Location",
            Reply::Json(json!({
                "resourceType": "Bundle",
                "link": [{"relation": "next", "url": "{base}/Location?page=2"}],
                "entry": [{"resource": {"id": "a"}}]
            })),
        )])
        .await;
        let client = client(&server, Carrier::Anthem);

        let dump = dump_locations(
            &client,
            "CA",
            Some(1),
            &output,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();
        assert_eq!(dump.rows, 1);
        assert_eq!(dump.stop, Some(PageStop::PageLimit));
        assert!(dump.failure.is_none());
    }
}
