use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use migration_rebase_core::{
    Direction, EngineError, MigrationEngine, RevisionId, ScriptDirectory, ScriptDocument,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const CREATE_MIGRATION_REVISIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS migration_revisions (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  revision TEXT NOT NULL UNIQUE,
  upgrade_sha256 TEXT NOT NULL,
  applied_at TEXT NOT NULL
);
";

/// Migration engine that runs script bodies against a `SQLite` database.
///
/// Every applied revision is recorded in `migration_revisions`; heads are
/// derived from that set and the parent links currently on disk.
pub struct SqliteEngine {
    conn: Connection,
    scripts: ScriptDirectory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedRevision {
    pub seq: i64,
    pub revision: RevisionId,
    pub upgrade_sha256: String,
    pub applied_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineStatus {
    pub applied: Vec<AppliedRevision>,
    pub heads: Vec<RevisionId>,
    pub missing_scripts: Vec<RevisionId>,
    pub drifted: Vec<RevisionId>,
}

impl SqliteEngine {
    /// Open the target database and make sure the bookkeeping table exists.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, configured, or
    /// bootstrapped.
    pub fn open(path: &Path, scripts: ScriptDirectory) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;
        conn.execute_batch(CREATE_MIGRATION_REVISIONS_SQL)
            .context("failed to apply migration_revisions table")?;

        Ok(Self { conn, scripts })
    }

    #[must_use]
    pub fn scripts(&self) -> &ScriptDirectory {
        &self.scripts
    }

    /// Applied revisions in application order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn applied(&self) -> Result<Vec<AppliedRevision>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, revision, upgrade_sha256, applied_at
             FROM migration_revisions
             ORDER BY seq ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut applied = Vec::new();
        while let Some(row) = rows.next()? {
            let revision_raw: String = row.get(1)?;
            applied.push(AppliedRevision {
                seq: row.get(0)?,
                revision: parse_revision(&revision_raw)?,
                upgrade_sha256: row.get(2)?,
                applied_at: row.get(3)?,
            });
        }
        Ok(applied)
    }

    /// Applied revisions that no other applied revision names as a parent.
    ///
    /// # Errors
    /// Returns an error when the applied set cannot be read or an applied
    /// revision has no script.
    pub fn heads(&self) -> Result<BTreeSet<RevisionId>> {
        let applied =
            self.applied()?.into_iter().map(|row| row.revision).collect::<BTreeSet<_>>();

        let mut parents = BTreeSet::new();
        for revision in &applied {
            let (_, document) = self.scripts.load(revision)?;
            parents.extend(document.parents().iter().cloned());
        }

        Ok(applied.difference(&parents).cloned().collect())
    }

    /// Apply every missing ancestor of `target`, parents first, then `target`.
    ///
    /// Returns the revisions applied by this call.
    ///
    /// # Errors
    /// Returns an error when the history cannot be resolved or a script fails;
    /// revisions applied before the failure stay applied.
    pub fn upgrade(&mut self, target: &RevisionId) -> Result<Vec<RevisionId>> {
        let order = self.ancestry(target)?;
        let applied = self.applied_set()?;

        let mut newly_applied = Vec::new();
        for (revision, document) in order {
            if applied.contains(&revision) {
                continue;
            }
            self.apply_upgrade(&revision, &document)?;
            newly_applied.push(revision);
        }

        if newly_applied.is_empty() {
            tracing::debug!("Store already contains {target}");
        }
        Ok(newly_applied)
    }

    /// Unapply, most recent first, every applied revision that is neither
    /// `target` nor one of its ancestors.
    ///
    /// Returns the revisions unapplied by this call.
    ///
    /// # Errors
    /// Returns an error when the history cannot be resolved or a downgrade
    /// body fails; revisions unapplied before the failure stay unapplied.
    pub fn downgrade(&mut self, target: &RevisionId) -> Result<Vec<RevisionId>> {
        let keep = self
            .ancestry(target)?
            .into_iter()
            .map(|(revision, _)| revision)
            .collect::<BTreeSet<_>>();

        let mut removed = Vec::new();
        for row in self.applied()?.into_iter().rev() {
            if keep.contains(&row.revision) {
                continue;
            }
            let (_, document) = self.scripts.load(&row.revision)?;
            self.apply_downgrade(&row.revision, &document)?;
            removed.push(row.revision);
        }
        Ok(removed)
    }

    /// Applied revisions, heads, and scripts whose upgrade body changed since
    /// they were applied.
    ///
    /// # Errors
    /// Returns an error when the database or script directory cannot be read.
    pub fn status(&self) -> Result<EngineStatus> {
        let applied = self.applied()?;
        let mut missing_scripts = Vec::new();
        let mut drifted = Vec::new();

        for row in &applied {
            let Some(handle) = self.scripts.locate(&row.revision)? else {
                missing_scripts.push(row.revision.clone());
                continue;
            };
            let document = self.scripts.parse(&handle)?;
            if sha256_hex(document.upgrade_body().unwrap_or_default()) != row.upgrade_sha256 {
                drifted.push(row.revision.clone());
            }
        }

        let heads = if missing_scripts.is_empty() {
            self.heads()?.into_iter().collect()
        } else {
            Vec::new()
        };

        Ok(EngineStatus { applied, heads, missing_scripts, drifted })
    }

    /// Whether `revision` is recorded as applied.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn is_applied(&self, revision: &RevisionId) -> Result<bool> {
        let seq = self
            .conn
            .query_row(
                "SELECT seq FROM migration_revisions WHERE revision = ?1",
                params![revision.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up revision {revision}"))?;
        Ok(seq.is_some())
    }

    fn applied_set(&self) -> Result<BTreeSet<RevisionId>> {
        Ok(self.applied()?.into_iter().map(|row| row.revision).collect())
    }

    /// `target` and all its ancestors through every parent, parents first.
    fn ancestry(&self, target: &RevisionId) -> Result<Vec<(RevisionId, ScriptDocument)>> {
        enum Visit {
            Enter(RevisionId),
            Exit(RevisionId, ScriptDocument),
        }

        let mut order = Vec::new();
        let mut done = BTreeSet::new();
        let mut on_path = BTreeSet::new();
        let mut stack = vec![Visit::Enter(target.clone())];

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(revision) => {
                    if done.contains(&revision) {
                        continue;
                    }
                    if !on_path.insert(revision.clone()) {
                        return Err(anyhow!("cyclic history detected at revision {revision}"));
                    }
                    let (_, document) = self.scripts.load(&revision)?;
                    let parents = document.parents().to_vec();
                    stack.push(Visit::Exit(revision, document));
                    for parent in parents.into_iter().rev() {
                        stack.push(Visit::Enter(parent));
                    }
                }
                Visit::Exit(revision, document) => {
                    on_path.remove(&revision);
                    if done.insert(revision.clone()) {
                        order.push((revision, document));
                    }
                }
            }
        }

        Ok(order)
    }

    fn apply_upgrade(&mut self, revision: &RevisionId, document: &ScriptDocument) -> Result<()> {
        let body = document
            .upgrade_body()
            .ok_or_else(|| anyhow!("revision {revision} has no `-- migrate:up` section"))?;

        let tx = self.conn.transaction().context("failed to start upgrade transaction")?;
        tx.execute_batch(body).with_context(|| format!("upgrade of {revision} failed"))?;
        tx.execute(
            "INSERT INTO migration_revisions(revision, upgrade_sha256, applied_at)
             VALUES (?1, ?2, ?3)",
            params![revision.as_str(), sha256_hex(body), now_rfc3339()?],
        )
        .with_context(|| format!("failed to record revision {revision}"))?;
        tx.commit().with_context(|| format!("failed to commit upgrade of {revision}"))?;

        tracing::info!("Applied {revision}");
        Ok(())
    }

    fn apply_downgrade(&mut self, revision: &RevisionId, document: &ScriptDocument) -> Result<()> {
        let body = document
            .downgrade_body()
            .ok_or_else(|| anyhow!("revision {revision} has no `-- migrate:down` section"))?;

        let tx = self.conn.transaction().context("failed to start downgrade transaction")?;
        tx.execute_batch(body).with_context(|| format!("downgrade of {revision} failed"))?;
        tx.execute(
            "DELETE FROM migration_revisions WHERE revision = ?1",
            params![revision.as_str()],
        )
        .with_context(|| format!("failed to unrecord revision {revision}"))?;
        tx.commit().with_context(|| format!("failed to commit downgrade of {revision}"))?;

        tracing::info!("Unapplied {revision}");
        Ok(())
    }
}

impl MigrationEngine for SqliteEngine {
    fn current_heads(&mut self) -> Result<BTreeSet<RevisionId>, EngineError> {
        self.heads().map_err(engine_error)
    }

    fn move_to(&mut self, revision: &RevisionId, direction: Direction) -> Result<(), EngineError> {
        match direction {
            Direction::Upgrade => self.upgrade(revision).map(drop).map_err(engine_error),
            Direction::Downgrade => self.downgrade(revision).map(drop).map_err(engine_error),
        }
    }
}

#[allow(clippy::needless_pass_by_value)]
fn engine_error(err: anyhow::Error) -> EngineError {
    EngineError::new(format!("{err:#}"))
}

fn parse_revision(raw: &str) -> Result<RevisionId> {
    RevisionId::parse(raw).ok_or_else(|| anyhow!("invalid revision id stored in database: {raw}"))
}

fn sha256_hex(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
