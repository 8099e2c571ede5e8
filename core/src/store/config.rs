use super::CollectionsStore;
use crate::{
    config::{ConfigSnapshot, DelinquencyConfig},
    error::{CollectionsError, CollectionsResult},
};
use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension};

impl CollectionsStore {
    // ── Configuration ──────────────────────────────────────────

    /// Publish a new configuration version and deactivate the previous one.
    pub fn save_configuration(
        &self,
        config: &DelinquencyConfig,
        activated_at: NaiveDateTime,
    ) -> CollectionsResult<ConfigSnapshot> {
        config.validate()?;
        let payload = serde_json::to_string(config)?;
        self.atomically(|store| {
            store
                .conn
                .execute("UPDATE delinquency_config SET active = 0 WHERE active = 1", [])?;
            store.conn.execute(
                "INSERT INTO delinquency_config (activated_at, active, payload) VALUES (?1, 1, ?2)",
                params![activated_at, payload],
            )?;
            let version = store.conn.last_insert_rowid();
            log::info!("delinquency configuration v{version} activated");
            Ok(ConfigSnapshot {
                version,
                activated_at,
                config: config.clone(),
            })
        })
    }

    pub fn load_active_configuration(&self) -> CollectionsResult<ConfigSnapshot> {
        let row: Option<(i64, NaiveDateTime, String)> = self
            .conn
            .query_row(
                "SELECT version, activated_at, payload FROM delinquency_config
                 WHERE active = 1 ORDER BY version DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (version, activated_at, payload) = row.ok_or(CollectionsError::ConfigurationMissing)?;
        Ok(ConfigSnapshot {
            version,
            activated_at,
            config: serde_json::from_str(&payload)?,
        })
    }

    /// Stamp the active configuration's job with its last run time.
    pub fn record_job_run(&self, at: NaiveDateTime) -> CollectionsResult<()> {
        self.conn.execute(
            "UPDATE delinquency_config SET last_run_at = ?1 WHERE active = 1",
            params![at],
        )?;
        Ok(())
    }

    pub fn last_job_run(&self) -> CollectionsResult<Option<NaiveDateTime>> {
        let at = self
            .conn
            .query_row(
                "SELECT last_run_at FROM delinquency_config WHERE active = 1",
                [],
                |row| row.get::<_, Option<NaiveDateTime>>(0),
            )
            .optional()?;
        Ok(at.flatten())
    }
}
