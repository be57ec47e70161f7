use anyhow::{Context, Result};
use csv::{Reader, Writer};
use std::{collections::HashSet, path::Path};

use crate::{
    common::{ensure_parent_dir, replace_file, tmp_path_for},
    record::ProviderRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeSummary {
    pub existing: usize,
    pub added: usize,
    pub duplicates: usize,
    pub total: usize,
}

pub fn read_records(path: &Path) -> Result<Vec<ProviderRecord>> {
    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed opening provider CSV {}", path.display()))?;
    let mut records = Vec::new();
    for (index, row) in reader.deserialize().enumerate() {
        let record: ProviderRecord = row.with_context(|| {
            format!("Failed parsing row {} of {}", index + 2, path.display())
        })?;
        records.push(record);
    }
    Ok(records)
}

pub fn write_records(path: &Path, records: &[ProviderRecord]) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp_path = tmp_path_for(path, "providers.csv");
    let mut writer = Writer::from_path(&tmp_path)
        .with_context(|| format!("Failed creating temp provider CSV {}", tmp_path.display()))?;
    for record in records {
        writer
            .serialize(record)
            .with_context(|| format!("Failed writing provider row {}", record.id))?;
    }
    writer
        .flush()
        .context("Failed flushing provider CSV writer")?;
    replace_file(&tmp_path, path)
}

/// Merges `incoming` into the CSV at `path`, one row per id. The first row seen for an id
/// is kept, so stored rows win over re-scraped ones.
pub fn merge_into_csv(path: &Path, incoming: Vec<ProviderRecord>) -> Result<MergeSummary> {
    let existing = if path.exists() {
        read_records(path)?
    } else {
        Vec::new()
    };

    let mut summary = MergeSummary {
        existing: existing.len(),
        ..MergeSummary::default()
    };
    let mut rows: Vec<ProviderRecord> = Vec::with_capacity(existing.len() + incoming.len());
    let mut seen: HashSet<String> = HashSet::new();

    for record in existing {
        if !seen.insert(record.id.clone()) {
            summary.duplicates += 1;
            continue;
        }
        rows.push(record);
    }
    for record in incoming {
        if !seen.insert(record.id.clone()) {
            summary.duplicates += 1;
            continue;
        }
        rows.push(record);
        summary.added += 1;
    }

    summary.total = rows.len();
    write_records(path, &rows)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::sample_record;

    #[test]
    fn first_run_creates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("providers.csv");
        let summary = merge_into_csv(
            &path,
            vec![sample_record("KP-1", "A"), sample_record("KP-2", "B")],
        )
        .unwrap();
        assert_eq!(
            summary,
            MergeSummary {
                existing: 0,
                added: 2,
                duplicates: 0,
                total: 2
            }
        );
        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], sample_record("KP-1", "A"));
    }

    #[test]
    fn stored_rows_win_over_rescraped_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.csv");
        merge_into_csv(
            &path,
            vec![sample_record("KP-1", "Old"), sample_record("KP-2", "B")],
        )
        .unwrap();

        let summary = merge_into_csv(
            &path,
            vec![sample_record("KP-1", "New"), sample_record("UN-9", "C")],
        )
        .unwrap();
        assert_eq!(summary.existing, 2);
        assert_eq!(summary.added, 1);
        assert_eq!(summary.duplicates, 1);

        let ids_and_names: Vec<(String, Option<String>)> = read_records(&path)
            .unwrap()
            .into_iter()
            .map(|r| (r.id, r.name))
            .collect();
        assert_eq!(
            ids_and_names,
            vec![
                ("KP-1".to_string(), Some("Old".to_string())),
                ("KP-2".to_string(), Some("B".to_string())),
                ("UN-9".to_string(), Some("C".to_string())),
            ]
        );
    }

    #[test]
    fn missing_optional_fields_round_trip_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.csv");
        let mut record = sample_record("KP-3", "No Coordinates");
        record.latitude = None;
        record.longitude = None;
        record.city = None;
        write_records(&path, &[record.clone()]).unwrap();
        assert_eq!(read_records(&path).unwrap(), vec![record]);
    }
}
