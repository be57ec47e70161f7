use anyhow::{Context, Result};
use rusqlite::{Connection as SqliteConnection, params};
use std::{fs, path::Path};

use crate::record::ProviderRecord;

/// The `providers` table the directory front end reads from.
pub struct ProviderStore {
    conn: SqliteConnection,
}

impl ProviderStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating database dir {}", parent.display()))?;
        }
        let conn = SqliteConnection::open(path)
            .with_context(|| format!("Failed opening provider database {}", path.display()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY,
                name TEXT,
                address TEXT,
                phone_number TEXT,
                latitude REAL,
                longitude REAL,
                provider_taxonomy_code TEXT NOT NULL,
                specialty TEXT NOT NULL,
                networks TEXT NOT NULL,
                last_updated TEXT,
                kaiser_epo_network INTEGER NOT NULL,
                kaiser_hmo_network INTEGER NOT NULL,
                kaiser_medi_cal_network INTEGER NOT NULL,
                kaiser_pos_network INTEGER NOT NULL,
                kaiser_senior_advantage_network INTEGER NOT NULL,
                city TEXT,
                state TEXT,
                zip_code TEXT,
                carrier TEXT,
                accepting_patients INTEGER NOT NULL,
                synced_at_unix INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_providers_carrier ON providers(carrier);
            CREATE INDEX IF NOT EXISTS idx_providers_zip ON providers(zip_code);
            ",
        )
        .context("Failed initializing providers schema")?;
        Ok(Self { conn })
    }

    pub fn upsert_records(&mut self, records: &[ProviderRecord]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("Failed starting providers transaction")?;
        {
            let mut stmt = tx
                .prepare(
                    "
                    INSERT INTO providers (
                        id, name, address, phone_number, latitude, longitude,
                        provider_taxonomy_code, specialty, networks, last_updated,
                        kaiser_epo_network, kaiser_hmo_network, kaiser_medi_cal_network,
                        kaiser_pos_network, kaiser_senior_advantage_network,
                        city, state, zip_code, carrier, accepting_patients, synced_at_unix
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                            ?16, ?17, ?18, ?19, ?20, strftime('%s', 'now'))
                    ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        address = excluded.address,
                        phone_number = excluded.phone_number,
                        latitude = excluded.latitude,
                        longitude = excluded.longitude,
                        provider_taxonomy_code = excluded.provider_taxonomy_code,
                        specialty = excluded.specialty,
                        networks = excluded.networks,
                        last_updated = excluded.last_updated,
                        kaiser_epo_network = excluded.kaiser_epo_network,
                        kaiser_hmo_network = excluded.kaiser_hmo_network,
                        kaiser_medi_cal_network = excluded.kaiser_medi_cal_network,
                        kaiser_pos_network = excluded.kaiser_pos_network,
                        kaiser_senior_advantage_network = excluded.kaiser_senior_advantage_network,
                        city = excluded.city,
                        state = excluded.state,
                        zip_code = excluded.zip_code,
                        carrier = excluded.carrier,
                        accepting_patients = excluded.accepting_patients,
                        synced_at_unix = excluded.synced_at_unix
                    ",
                )
                .context("Failed preparing providers upsert")?;
            for r in records {
                stmt.execute(params![
                    r.id,
                    r.name,
                    r.address,
                    r.phone,
                    r.latitude,
                    r.longitude,
                    r.taxonomy_code,
                    r.specialty,
                    r.networks,
                    r.last_updated,
                    r.epo_network,
                    r.hmo_network,
                    r.medi_cal_network,
                    r.pos_network,
                    r.senior_advantage_network,
                    r.city,
                    r.state,
                    r.zip_code,
                    r.carrier,
                    r.accepting_patients,
                ])
                .with_context(|| format!("Failed upserting provider {}", r.id))?;
            }
        }
        tx.commit().context("Failed committing providers upsert")?;
        Ok(records.len())
    }

    pub fn count(&self) -> Result<u64> {
        let rows: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM providers", [], |row| row.get(0))
            .context("Failed counting providers")?;
        u64::try_from(rows).context("Negative provider count")
    }

    #[cfg(test)]
    fn name_of(&self, id: &str) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;
        Ok(self
            .conn
            .query_row("SELECT name FROM providers WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?
            .flatten())
    }
}
