use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::{
    carrier::Carrier,
    constants::{DEFAULT_NOMINATIM_BASE_URL, DEFAULT_STATE},
};

#[derive(Parser, Debug)]
#[command(name = "provider_directory")]
#[command(about = "Scrape carrier FHIR provider directories into CSV and SQLite", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Walk PractitionerRole results for one city and merge them into providers.csv.
    Roles(RolesArgs),
    /// Crawl Location and HealthcareService per city/specialty and join them.
    Directory(DirectoryArgs),
    /// Dump every Location in a state as flattened JSON columns.
    Bulk(BulkArgs),
    /// Print how many PractitionerRole entries a carrier lists for one city.
    Count(CountArgs),
    /// Re-apply providers.csv to the SQLite providers table.
    SyncDb(SyncDbArgs),
}

/// Request pacing and endpoint settings shared by every carrier command.
#[derive(clap::Args, Debug, Clone)]
pub struct FetchArgs {
    /// Carrier FHIR base URL. Defaults to the carrier's public endpoint.
    #[arg(long)]
    pub base_url: Option<String>,

    /// Global request start rate for carrier API calls.
    #[arg(long, default_value_t = 4.0)]
    pub requests_per_second: f64,

    /// Max attempts for transient API failures (429/5xx/transport errors).
    #[arg(long, default_value_t = 5)]
    pub max_retries: u32,

    /// Stop after this many result pages per search.
    #[arg(long)]
    pub max_pages: Option<usize>,

    /// Two-letter state filter applied to every search.
    #[arg(long, default_value = DEFAULT_STATE)]
    pub state: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct GeocodeArgs {
    /// Nominatim base URL.
    ///
    /// The public instance allows at most one request per second:
    /// https://operations.osmfoundation.org/policies/nominatim/
    #[arg(long, default_value = DEFAULT_NOMINATIM_BASE_URL)]
    pub geocoder_url: String,

    #[arg(long, default_value_t = 1.0)]
    pub geocode_requests_per_second: f64,

    /// SQLite cache database for geocoder answers.
    #[arg(long)]
    pub geocode_cache_db: Option<PathBuf>,

    /// Answer geocoding from the cache only.
    #[arg(long, default_value_t = false)]
    pub geocode_offline: bool,

    /// Leave coordinates and cities empty when the carrier omits them.
    #[arg(long, default_value_t = false)]
    pub skip_geocode: bool,

    /// Delete the geocode cache before running.
    #[arg(long, default_value_t = false)]
    pub reset_geocode_cache: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RolesArgs {
    #[arg(value_enum)]
    pub carrier: Carrier,

    pub city: String,

    #[command(flatten)]
    pub fetch: FetchArgs,

    #[command(flatten)]
    pub geocode: GeocodeArgs,

    /// Max concurrent HealthcareService/Location reads per page.
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Merged provider CSV path.
    #[arg(long)]
    pub providers_csv: Option<PathBuf>,

    /// SQLite database holding the providers table.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Only update providers.csv.
    #[arg(long, default_value_t = false)]
    pub no_db: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DirectoryArgs {
    #[arg(value_enum)]
    pub carrier: Carrier,

    /// City to crawl. Repeat for several cities.
    #[arg(long = "city", required = true)]
    pub cities: Vec<String>,

    /// Specialty filter for HealthcareService searches. Repeat for several.
    #[arg(long = "specialty")]
    pub specialties: Vec<String>,

    #[command(flatten)]
    pub fetch: FetchArgs,

    /// Joined output path. Defaults to data/<carrier>_resource.csv.
    #[arg(long)]
    pub output_csv: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct BulkArgs {
    #[arg(value_enum)]
    pub carrier: Carrier,

    #[command(flatten)]
    pub fetch: FetchArgs,

    /// Output path. Defaults to data/<state>_<carrier>_providers.csv.
    #[arg(long)]
    pub output_csv: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct CountArgs {
    #[arg(value_enum)]
    pub carrier: Carrier,

    pub city: String,

    #[command(flatten)]
    pub fetch: FetchArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SyncDbArgs {
    #[arg(long)]
    pub providers_csv: Option<PathBuf>,

    #[arg(long)]
    pub db: Option<PathBuf>,
}
