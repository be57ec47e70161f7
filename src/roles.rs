use anyhow::Result;
use futures::{StreamExt, stream::FuturesUnordered};
use indicatif::{ProgressBar, ProgressStyle};
use serde::de::DeserializeOwned;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, atomic::AtomicBool},
};

use crate::{
    carrier::attribute_carrier,
    client::FhirClient,
    extract::{
        NetworkStatus, extract_state_zip, network_status, normalize_zip5, role_location_reference,
        role_service_reference, specialty_of,
    },
    fhir::{HealthcareService, Location, PractitionerRole, first_phone},
    geocode::{Coordinates, Geocoder},
    paginate::{PageStop, Paginator},
    record::ProviderRecord,
};

pub struct RoleSearch<'a> {
    pub city: &'a str,
    pub state: &'a str,
    pub max_pages: Option<usize>,
    pub concurrency: usize,
}

#[derive(Debug, Default)]
pub struct RoleScrape {
    pub records: Vec<ProviderRecord>,
    pub total: Option<u64>,
    pub pages: usize,
    pub skipped: usize,
    pub interrupted: bool,
    /// Page fetch error that ended the crawl early. Records read before it are kept.
    pub failure: Option<String>,
}

/// Child resources read during one run, keyed by reference. `None` marks a failed read.
#[derive(Default)]
struct ResourceMemo {
    services: HashMap<String, Option<HealthcareService>>,
    locations: HashMap<String, Option<Location>>,
}

pub async fn scrape_practitioner_roles(
    client: &FhirClient,
    geocoder: Option<&Geocoder>,
    search: &RoleSearch<'_>,
    shutdown: Arc<AtomicBool>,
) -> Result<RoleScrape> {
    let url = client.search_url(
        "PractitionerRole",
        &[
            ("location.address-city", search.city),
            ("location.address-state", search.state),
        ],
    )?;
    let mut pages = Paginator::<PractitionerRole>::new(client, url)
        .with_max_pages(search.max_pages)
        .with_shutdown(shutdown);

    let progress = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [roles {elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }

    let mut memo = ResourceMemo::default();
    let mut scrape = RoleScrape::default();

    loop {
        let bundle = match pages.next_page().await {
            Ok(Some(bundle)) => bundle,
            Ok(None) => break,
            Err(err) => {
                tracing::error!(
                    page = pages.pages_fetched() + 1,
                    error = %err,
                    "PractitionerRole crawl stopped early; keeping records read so far"
                );
                scrape.failure = Some(format!("{err:#}"));
                break;
            }
        };
        if pages.pages_fetched() == 1 {
            let total = pages.total().unwrap_or_default();
            tracing::info!(
                carrier = %client.carrier(),
                city = search.city,
                total,
                "PractitionerRole search"
            );
            progress.set_length(total);
        }

        let roles: Vec<PractitionerRole> = bundle.into_resources().collect();
        if roles.is_empty() {
            tracing::warn!(page = pages.pages_fetched(), "page has no entries; skipping");
            continue;
        }
        tracing::debug!(page = pages.pages_fetched(), entries = roles.len(), "processing page");

        dereference_children(client, &roles, &mut memo, search.concurrency).await;

        for role in &roles {
            progress.inc(1);
            match build_record(client, geocoder, role, &memo).await? {
                Some(record) => scrape.records.push(record),
                None => scrape.skipped += 1,
            }
        }
        progress.set_message(format!(
            "page={} rows={} skipped={}",
            pages.pages_fetched(),
            scrape.records.len(),
            scrape.skipped
        ));
    }

    scrape.total = pages.total();
    scrape.pages = pages.pages_fetched();
    scrape.interrupted = pages.stop_reason() == Some(PageStop::Interrupted);
    progress.finish_with_message(format!(
        "done: pages={} rows={} skipped={}",
        scrape.pages,
        scrape.records.len(),
        scrape.skipped
    ));
    Ok(scrape)
}

async fn dereference_children(
    client: &FhirClient,
    roles: &[PractitionerRole],
    memo: &mut ResourceMemo,
    concurrency: usize,
) {
    let service_refs = unseen(
        roles.iter().filter_map(role_service_reference),
        &memo.services,
    );
    let location_refs = unseen(
        roles.iter().filter_map(role_location_reference),
        &memo.locations,
    );

    for (reference, result) in
        read_all::<HealthcareService>(client, service_refs, concurrency).await
    {
        if let Err(err) = &result {
            tracing::warn!(reference, error = %err, "failed reading HealthcareService");
        }
        memo.services.insert(reference, result.ok());
    }
    for (reference, result) in read_all::<Location>(client, location_refs, concurrency).await {
        if let Err(err) = &result {
            tracing::warn!(reference, error = %err, "failed reading Location");
        }
        memo.locations.insert(reference, result.ok());
    }
}

fn unseen<'a, T>(
    references: impl Iterator<Item = &'a str>,
    known: &HashMap<String, Option<T>>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    references
        .filter(|r| !known.contains_key(*r))
        .filter(|r| seen.insert(*r))
        .map(str::to_string)
        .collect()
}

async fn read_all<T: DeserializeOwned>(
    client: &FhirClient,
    references: Vec<String>,
    concurrency: usize,
) -> Vec<(String, Result<T>)> {
    let mut queue = references.into_iter();
    let mut in_flight = FuturesUnordered::new();
    for _ in 0..concurrency.max(1) {
        if let Some(reference) = queue.next() {
            in_flight.push(read_one::<T>(client, reference));
        }
    }

    let mut results = Vec::new();
    while let Some(result) = in_flight.next().await {
        results.push(result);
        if let Some(reference) = queue.next() {
            in_flight.push(read_one::<T>(client, reference));
        }
    }
    results
}

async fn read_one<T: DeserializeOwned>(
    client: &FhirClient,
    reference: String,
) -> (String, Result<T>) {
    let result = client.read(&reference).await;
    (reference, result)
}

async fn build_record(
    client: &FhirClient,
    geocoder: Option<&Geocoder>,
    role: &PractitionerRole,
    memo: &ResourceMemo,
) -> Result<Option<ProviderRecord>> {
    let Some(role_id) = role.id.as_deref() else {
        tracing::warn!("PractitionerRole without an id; skipping");
        return Ok(None);
    };
    let Some(location) = role_location_reference(role)
        .and_then(|r| memo.locations.get(r))
        .and_then(Option::as_ref)
    else {
        tracing::warn!(role_id, "no readable Location; skipping");
        return Ok(None);
    };
    let service = role_service_reference(role)
        .and_then(|r| memo.services.get(r))
        .and_then(Option::as_ref);

    let address = location.address.as_ref();
    let address_text = address.and_then(|a| a.display_text());

    let mut coordinates = location.position.and_then(|p| {
        Some(Coordinates {
            latitude: p.latitude?,
            longitude: p.longitude?,
        })
    });
    if coordinates.is_none() {
        if let (Some(geocoder), Some(text)) = (geocoder, address_text.as_deref()) {
            coordinates = geocoder.locate(text).await?;
        }
    }

    let mut city = address
        .and_then(|a| a.city.clone())
        .filter(|c| !c.trim().is_empty());
    if city.is_none() {
        if let (Some(geocoder), Some(point)) = (geocoder, coordinates) {
            city = geocoder.city_for(point).await?;
        }
    }

    let parsed = address_text.as_deref().and_then(extract_state_zip);
    let state = address
        .and_then(|a| a.state.clone())
        .or_else(|| parsed.as_ref().map(|(state, _)| state.clone()));
    let zip_code = address
        .and_then(|a| a.postal_code.as_deref())
        .or_else(|| parsed.as_ref().map(|(_, zip)| zip.as_str()))
        .and_then(normalize_zip5);

    let status = network_status(role, client.carrier());
    if let NetworkStatus::Unrecognized(codes) = &status {
        tracing::warn!(role_id, ?codes, "unrecognized network codes; review manually");
    }
    let networks = status.display();
    let carrier = match status {
        NetworkStatus::Listed(_) => Some(
            attribute_carrier(&networks)
                .unwrap_or(client.carrier().display_name())
                .to_string(),
        ),
        NetworkStatus::NotAccepting | NetworkStatus::Unrecognized(_) => None,
    };

    let specialty = specialty_of(service);
    let name = role
        .practitioner
        .as_ref()
        .and_then(|p| p.display.clone())
        .or_else(|| location.name.clone());
    let phone = first_phone(&location.telecom).or_else(|| service.and_then(|s| first_phone(&s.telecom)));

    let mut record = ProviderRecord {
        id: format!("{}-{}", client.carrier().code(), role_id),
        name,
        address: address_text,
        phone,
        latitude: coordinates.map(|c| c.latitude),
        longitude: coordinates.map(|c| c.longitude),
        taxonomy_code: specialty.code,
        specialty: specialty.display,
        networks,
        last_updated: role.meta.as_ref().and_then(|m| m.last_updated.clone()),
        epo_network: 0,
        hmo_network: 0,
        medi_cal_network: 0,
        pos_network: 0,
        senior_advantage_network: 0,
        city,
        state,
        zip_code,
        accepting_patients: u8::from(carrier.is_some()),
        carrier,
    };
    record.set_network_flags();
    Ok(Some(record))
}
