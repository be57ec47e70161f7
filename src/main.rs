mod args;
mod bulk;
mod carrier;
mod client;
mod common;
mod constants;
mod count;
mod directory;
mod export;
mod extract;
mod fhir;
mod geocode;
mod paginate;
mod record;
mod roles;
mod store;
#[cfg(test)]
mod test_server;

use anyhow::{Context, Result, bail};
use clap::Parser;
use reqwest::Client;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, atomic::AtomicBool},
};

use args::{Args, BulkArgs, Command, CountArgs, DirectoryArgs, FetchArgs, RolesArgs, SyncDbArgs};
use client::{FhirClient, RateLimiter, RetryPolicy};
use common::{delete_if_exists, install_ctrlc_handler, project_root};
use constants::{DEFAULT_NOMINATIM_BASE_URL, NOMINATIM_USAGE_POLICY_URL, USER_AGENT};
use directory::{DirectoryPaths, DirectorySearch};
use geocode::{Geocoder, GeocoderSettings};
use roles::RoleSearch;
use store::ProviderStore;

struct DataPaths {
    data_dir: PathBuf,
    providers_csv: PathBuf,
    providers_db: PathBuf,
    geocode_cache_db: PathBuf,
}

impl DataPaths {
    fn under(data_dir: PathBuf) -> Self {
        Self {
            providers_csv: data_dir.join("providers.csv"),
            providers_db: data_dir.join("providers.sqlite"),
            geocode_cache_db: data_dir.join("cache").join("geocode_cache.sqlite"),
            data_dir,
        }
    }
}

fn fhir_client(http: &Client, carrier: carrier::Carrier, fetch: &FetchArgs) -> Result<FhirClient> {
    FhirClient::new(
        http.clone(),
        carrier,
        fetch.base_url.as_deref(),
        RateLimiter::per_second(fetch.requests_per_second),
        RetryPolicy::new(fetch.max_retries),
    )
}

fn upsert_into_store(db: &Path, records: &[record::ProviderRecord]) -> Result<()> {
    let mut store = ProviderStore::open(db)?;
    let written = store.upsert_records(records)?;
    println!(
        "Upserted {} providers into {} ({} total)",
        written,
        db.display(),
        store.count()?
    );
    Ok(())
}

async fn run_roles(
    cmd: RolesArgs,
    http: &Client,
    paths: &DataPaths,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let client = fhir_client(http, cmd.carrier, &cmd.fetch)?;
    let providers_csv = cmd.providers_csv.unwrap_or_else(|| paths.providers_csv.clone());
    let db = cmd.db.unwrap_or_else(|| paths.providers_db.clone());

    let geocoder = if cmd.geocode.skip_geocode {
        None
    } else {
        let cache_db = cmd
            .geocode
            .geocode_cache_db
            .clone()
            .unwrap_or_else(|| paths.geocode_cache_db.clone());
        if cmd.geocode.reset_geocode_cache {
            delete_if_exists(&cache_db)?;
            println!("Reset geocode cache {}", cache_db.display());
        }
        if cmd.geocode.geocoder_url == DEFAULT_NOMINATIM_BASE_URL
            && cmd.geocode.geocode_requests_per_second > 1.0
        {
            tracing::warn!(
                rate = cmd.geocode.geocode_requests_per_second,
                policy = NOMINATIM_USAGE_POLICY_URL,
                "public Nominatim allows one request per second"
            );
        }
        Some(Geocoder::new(
            http.clone(),
            GeocoderSettings {
                base_url: &cmd.geocode.geocoder_url,
                cache_db: &cache_db,
                requests_per_second: cmd.geocode.geocode_requests_per_second,
                retry: RetryPolicy::new(cmd.fetch.max_retries),
                offline: cmd.geocode.geocode_offline,
            },
        )?)
    };

    let scrape = roles::scrape_practitioner_roles(
        &client,
        geocoder.as_ref(),
        &RoleSearch {
            city: &cmd.city,
            state: &cmd.fetch.state,
            max_pages: cmd.fetch.max_pages,
            concurrency: cmd.concurrency,
        },
        shutdown,
    )
    .await?;

    println!(
        "{} {}: {} records from {} pages ({} of {} reported, {} skipped)",
        cmd.carrier,
        cmd.city,
        scrape.records.len(),
        scrape.pages,
        scrape.records.len() + scrape.skipped,
        scrape.total.unwrap_or_default(),
        scrape.skipped
    );
    if scrape.interrupted {
        println!("Interrupted; saving the records collected so far.");
    }
    let failure = scrape.failure;

    if !cmd.no_db {
        upsert_into_store(&db, &scrape.records)?;
    }

    let summary = export::merge_into_csv(&providers_csv, scrape.records)?;
    println!(
        "Wrote {} ({} existing, {} added, {} duplicates, {} total)",
        providers_csv.display(),
        summary.existing,
        summary.added,
        summary.duplicates,
        summary.total
    );
    if let Some(failure) = failure {
        bail!("PractitionerRole crawl ended early: {failure}");
    }
    Ok(())
}

async fn run_directory(
    cmd: DirectoryArgs,
    http: &Client,
    paths: &DataPaths,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let client = fhir_client(http, cmd.carrier, &cmd.fetch)?;
    let slug = cmd.carrier.slug();
    let dir_paths = DirectoryPaths {
        locations_csv: paths.data_dir.join(format!("{slug}_locations.csv")),
        services_csv: paths.data_dir.join(format!("{slug}_services.csv")),
        output_csv: cmd
            .output_csv
            .clone()
            .unwrap_or_else(|| paths.data_dir.join(format!("{slug}_resource.csv"))),
    };

    let scrape = directory::scrape_directory(
        &client,
        &DirectorySearch {
            cities: &cmd.cities,
            specialties: &cmd.specialties,
            state: &cmd.fetch.state,
            max_pages: cmd.fetch.max_pages,
        },
        &dir_paths,
        shutdown,
    )
    .await?;

    if scrape.interrupted {
        println!("Interrupted; tables hold the results collected so far.");
    }
    println!(
        "Wrote {} locations to {} and {} services to {}",
        scrape.locations,
        dir_paths.locations_csv.display(),
        scrape.services,
        dir_paths.services_csv.display()
    );
    println!(
        "Wrote {} joined rows to {}",
        scrape.merged_rows,
        dir_paths.output_csv.display()
    );
    if let Some(failure) = scrape.failure {
        bail!("Directory crawl ended early: {failure}");
    }
    Ok(())
}

async fn run_bulk(
    cmd: BulkArgs,
    http: &Client,
    paths: &DataPaths,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let client = fhir_client(http, cmd.carrier, &cmd.fetch)?;
    let output = cmd.output_csv.clone().unwrap_or_else(|| {
        paths.data_dir.join(format!(
            "{}_{}_providers.csv",
            cmd.fetch.state.to_ascii_lowercase(),
            cmd.carrier.slug()
        ))
    });

    let dump = bulk::dump_locations(
        &client,
        &cmd.fetch.state,
        cmd.fetch.max_pages,
        &output,
        shutdown,
    )
    .await?;
    println!(
        "Wrote {} rows x {} columns from {} pages to {}",
        dump.rows,
        dump.columns,
        dump.pages,
        output.display()
    );
    if let Some(failure) = dump.failure {
        bail!("Location crawl ended early after {} pages: {failure}", dump.pages);
    }
    if dump.stop == Some(paginate::PageStop::Interrupted) {
        println!("Interrupted; output holds the pages fetched so far.");
    }
    Ok(())
}

async fn run_count(cmd: CountArgs, http: &Client) -> Result<()> {
    let client = fhir_client(http, cmd.carrier, &cmd.fetch)?;
    let total = count::count_practitioner_roles(&client, &cmd.city, &cmd.fetch.state).await?;
    println!("{} {}, {}: {total}", cmd.carrier, cmd.city, cmd.fetch.state);
    Ok(())
}

fn run_sync_db(cmd: SyncDbArgs, paths: &DataPaths) -> Result<()> {
    let providers_csv = cmd.providers_csv.unwrap_or_else(|| paths.providers_csv.clone());
    let db = cmd.db.unwrap_or_else(|| paths.providers_db.clone());
    if !providers_csv.exists() {
        bail!("Provider CSV not found at {}", providers_csv.display());
    }
    let records = export::read_records(&providers_csv)?;
    upsert_into_store(&db, &records)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let data_dir = project_root().join("data");
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed creating {}", data_dir.display()))?;
    let paths = DataPaths::under(data_dir);

    let http = Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("Failed creating HTTP client")?;

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    install_ctrlc_handler(Arc::clone(&shutdown_requested));

    match args.cmd {
        Command::Roles(cmd) => run_roles(cmd, &http, &paths, shutdown_requested)
            .await
            .context("roles failed"),
        Command::Directory(cmd) => run_directory(cmd, &http, &paths, shutdown_requested)
            .await
            .context("directory failed"),
        Command::Bulk(cmd) => run_bulk(cmd, &http, &paths, shutdown_requested)
            .await
            .context("bulk failed"),
        Command::Count(cmd) => run_count(cmd, &http).await.context("count failed"),
        Command::SyncDb(cmd) => run_sync_db(cmd, &paths).context("sync-db failed"),
    }
}
