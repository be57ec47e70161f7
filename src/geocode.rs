use anyhow::{Context, Result};
use reqwest::{Client, Url};
use rusqlite::{Connection as SqliteConnection, OptionalExtension, params};
use serde::Deserialize;
use std::{fs, path::Path};

use crate::{
    client::{RateLimiter, RetryPolicy, fetch_json},
    extract::clean_address,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GeocodeKind {
    Forward,
    Reverse,
}

impl GeocodeKind {
    fn as_str(self) -> &'static str {
        match self {
            GeocodeKind::Forward => "forward",
            GeocodeKind::Reverse => "reverse",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Cached {
    Point(Coordinates),
    City(String),
    NotFound,
}

struct GeocodeCache {
    conn: SqliteConnection,
}

impl GeocodeCache {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating cache dir {}", parent.display()))?;
        }
        let conn = SqliteConnection::open(path)
            .with_context(|| format!("Failed opening geocode cache DB {}", path.display()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS geocode_cache (
                kind TEXT NOT NULL,
                query TEXT NOT NULL,
                latitude REAL,
                longitude REAL,
                city TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                fetched_at_unix INTEGER NOT NULL,
                PRIMARY KEY (kind, query)
            );
            CREATE INDEX IF NOT EXISTS idx_geocode_cache_status ON geocode_cache(status);
            ",
        )
        .context("Failed initializing geocode cache schema")?;
        Ok(Self { conn })
    }

    /// Settled entries only. Errors are retried on the next lookup.
    fn lookup(&self, kind: GeocodeKind, query: &str) -> Result<Option<Cached>> {
        let row: Option<(String, Option<f64>, Option<f64>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT status, latitude, longitude, city FROM geocode_cache
                 WHERE kind = ?1 AND query = ?2",
                params![kind.as_str(), query],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .with_context(|| format!("Failed geocode cache lookup for {query}"))?;

        Ok(match row {
            Some((status, lat, lon, city)) => match (status.as_str(), kind) {
                ("not_found", _) => Some(Cached::NotFound),
                ("ok", GeocodeKind::Forward) => match (lat, lon) {
                    (Some(latitude), Some(longitude)) => Some(Cached::Point(Coordinates {
                        latitude,
                        longitude,
                    })),
                    _ => None,
                },
                ("ok", GeocodeKind::Reverse) => city.map(Cached::City),
                _ => None,
            },
            None => None,
        })
    }

    fn upsert(
        &self,
        kind: GeocodeKind,
        query: &str,
        point: Option<Coordinates>,
        city: Option<&str>,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "
                INSERT INTO geocode_cache
                    (kind, query, latitude, longitude, city, status, error_message, fetched_at_unix)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, strftime('%s', 'now'))
                ON CONFLICT(kind, query) DO UPDATE SET
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    city = excluded.city,
                    status = excluded.status,
                    error_message = excluded.error_message,
                    fetched_at_unix = excluded.fetched_at_unix
                ",
                params![
                    kind.as_str(),
                    query,
                    point.map(|p| p.latitude),
                    point.map(|p| p.longitude),
                    city,
                    status,
                    error_message
                ],
            )
            .with_context(|| format!("Failed updating geocode cache for {query}"))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SearchPlace {
    lat: String,
    lon: String,
}

#[derive(Debug, Deserialize)]
struct ReversePlace {
    address: Option<ReverseAddress>,
}

#[derive(Debug, Deserialize)]
struct ReverseAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
}

pub struct GeocoderSettings<'a> {
    pub base_url: &'a str,
    pub cache_db: &'a Path,
    pub requests_per_second: f64,
    pub retry: RetryPolicy,
    /// Answer from the cache only.
    pub offline: bool,
}

/// Nominatim lookups backed by a persistent SQLite cache.
pub struct Geocoder {
    http: Client,
    base_url: Url,
    limiter: RateLimiter,
    retry: RetryPolicy,
    cache: GeocodeCache,
    offline: bool,
}

impl Geocoder {
    pub fn new(http: Client, settings: GeocoderSettings<'_>) -> Result<Self> {
        let raw = settings.base_url;
        let with_slash = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{raw}/")
        };
        let base_url =
            Url::parse(&with_slash).with_context(|| format!("Invalid geocoder URL {raw}"))?;
        Ok(Self {
            http,
            base_url,
            limiter: RateLimiter::per_second(settings.requests_per_second),
            retry: settings.retry,
            cache: GeocodeCache::open(settings.cache_db)?,
            offline: settings.offline,
        })
    }

    /// Coordinates for a street address, `None` when Nominatim has no match.
    pub async fn locate(&self, address: &str) -> Result<Option<Coordinates>> {
        let query = clean_address(address);
        if query.is_empty() {
            return Ok(None);
        }
        match self.cache.lookup(GeocodeKind::Forward, &query)? {
            Some(Cached::Point(point)) => return Ok(Some(point)),
            Some(_) => return Ok(None),
            None if self.offline => return Ok(None),
            None => {}
        }

        let mut url = self
            .base_url
            .join("search")
            .context("Failed building geocoder search URL")?;
        url.query_pairs_mut()
            .append_pair("q", &query)
            .append_pair("format", "json")
            .append_pair("limit", "1");

        let places: Vec<SearchPlace> =
            match fetch_json(&self.http, url.as_str(), "application/json", &self.limiter, self.retry)
                .await
            {
                Ok(places) => places,
                Err(err) => {
                    tracing::warn!(address, error = %err, "geocoding failed");
                    self.cache.upsert(
                        GeocodeKind::Forward,
                        &query,
                        None,
                        None,
                        "error",
                        Some(&err.to_string()),
                    )?;
                    return Ok(None);
                }
            };

        let point = places.first().and_then(|place| {
            Some(Coordinates {
                latitude: place.lat.trim().parse().ok()?,
                longitude: place.lon.trim().parse().ok()?,
            })
        });
        match point {
            Some(point) => {
                self.cache
                    .upsert(GeocodeKind::Forward, &query, Some(point), None, "ok", None)?;
            }
            None => {
                tracing::info!(address, "unable to find coordinates");
                self.cache
                    .upsert(GeocodeKind::Forward, &query, None, None, "not_found", None)?;
            }
        }
        Ok(point)
    }

    /// City containing a coordinate pair.
    pub async fn city_for(&self, point: Coordinates) -> Result<Option<String>> {
        let query = format!("{:.6},{:.6}", point.latitude, point.longitude);
        match self.cache.lookup(GeocodeKind::Reverse, &query)? {
            Some(Cached::City(city)) => return Ok(Some(city)),
            Some(_) => return Ok(None),
            None if self.offline => return Ok(None),
            None => {}
        }

        let mut url = self
            .base_url
            .join("reverse")
            .context("Failed building geocoder reverse URL")?;
        url.query_pairs_mut()
            .append_pair("lat", &point.latitude.to_string())
            .append_pair("lon", &point.longitude.to_string())
            .append_pair("format", "json");

        let place: ReversePlace =
            match fetch_json(&self.http, url.as_str(), "application/json", &self.limiter, self.retry)
                .await
            {
                Ok(place) => place,
                Err(err) => {
                    tracing::warn!(query, error = %err, "reverse geocoding failed");
                    self.cache.upsert(
                        GeocodeKind::Reverse,
                        &query,
                        None,
                        None,
                        "error",
                        Some(&err.to_string()),
                    )?;
                    return Ok(None);
                }
            };

        let city = place
            .address
            .and_then(|a| a.city.or(a.town).or(a.village))
            .filter(|c| !c.trim().is_empty());
        match city.as_deref() {
            Some(city) => {
                self.cache
                    .upsert(GeocodeKind::Reverse, &query, None, Some(city), "ok", None)?;
            }
            None => {
                self.cache
                    .upsert(GeocodeKind::Reverse, &query, None, None, "not_found", None)?;
            }
        }
        Ok(city)
    }
}
