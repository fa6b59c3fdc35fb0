use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::types::{AgentInstruction, ListOptions, NewInstruction};
use super::version;

/// Error from instruction store operations.
///
/// `VersionNotFound` is the one domain error: the HTTP layer maps it to a
/// client-facing 404 instead of a server error. Everything else propagates
/// unchanged as `Db`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("instruction version {version} not found for agent '{agent_id}'")]
    VersionNotFound { agent_id: String, version: String },
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

/// SQLite-backed storage for versioned agent instructions.
///
/// One row per revision, keyed by `(agent_id, created_at)`. The padded
/// `version_key` column carries the version index; a partial unique index on
/// `agent_id WHERE is_active = 1` enforces the single-active invariant at the
/// schema level, and the deactivate/activate write pairs run inside one
/// transaction so no interleaving can observe zero or two active rows.
///
/// Thread safety: wraps `Connection` in `Mutex`. API handlers open a
/// short-lived store per request; tests share a single in-memory store.
pub struct InstructionStore {
    conn: Mutex<Connection>,
}

impl InstructionStore {
    /// Open (or create) the instruction database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;

             CREATE TABLE IF NOT EXISTS agent_instructions (
                 agent_id     TEXT NOT NULL,
                 created_at   TEXT NOT NULL,
                 version_key  TEXT NOT NULL,
                 instruction  TEXT NOT NULL,
                 is_active    INTEGER NOT NULL DEFAULT 0,
                 change_note  TEXT,
                 updated_by   TEXT NOT NULL,
                 updated_at   TEXT NOT NULL,
                 PRIMARY KEY (agent_id, created_at)
             );
             CREATE INDEX IF NOT EXISTS idx_instructions_version
                 ON agent_instructions(agent_id, version_key);
             CREATE UNIQUE INDEX IF NOT EXISTS idx_instructions_active
                 ON agent_instructions(agent_id) WHERE is_active = 1;",
        )?;
        Ok(())
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Append a new instruction revision and make it the active one.
    ///
    /// When `version` is absent, the latest version's minor component is
    /// bumped (`"1.3"` -> `"1.4"`); a fresh agent starts at `"1.0"`. The
    /// previously active revision (if any) is deactivated in the same
    /// transaction as the insert.
    pub fn create_instruction(
        &self,
        new: &NewInstruction,
    ) -> Result<AgentInstruction, StoreError> {
        let display_version = match &new.version {
            Some(v) => v.clone(),
            None => match self.get_latest_version(&new.agent_id)? {
                Some(latest) => version::bump_minor(&latest.version),
                None => version::FIRST_VERSION.to_string(),
            },
        };
        let version_key = version::pad(&display_version);

        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute_batch("BEGIN")?;
        let result = (|| -> Result<AgentInstruction, StoreError> {
            let created_at = unique_created_at(&guard, &new.agent_id)?;
            guard.execute(
                "UPDATE agent_instructions SET is_active = 0, updated_at = ?2
                 WHERE agent_id = ?1 AND is_active = 1",
                params![new.agent_id, created_at],
            )?;
            guard.execute(
                "INSERT INTO agent_instructions
                    (agent_id, created_at, version_key, instruction, is_active,
                     change_note, updated_by, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?2)",
                params![
                    new.agent_id,
                    created_at,
                    version_key,
                    new.instruction,
                    new.change_note,
                    new.updated_by,
                ],
            )?;
            Ok(AgentInstruction {
                agent_id: new.agent_id.clone(),
                version: version::unpad(&version_key),
                instruction: new.instruction.clone(),
                is_active: true,
                change_note: new.change_note.clone(),
                updated_by: new.updated_by.clone(),
                created_at: created_at.clone(),
                updated_at: created_at,
            })
        })();

        match result {
            Ok(rec) => {
                guard.execute_batch("COMMIT")?;
                Ok(rec)
            }
            Err(e) => {
                let _ = guard.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Make the revision with the given display version the active one.
    ///
    /// Fails with `VersionNotFound` (and mutates nothing) when no revision
    /// carries that version. Re-activating the already-active version still
    /// rewrites `updated_by`/`updated_at`.
    pub fn activate_instruction(
        &self,
        agent_id: &str,
        version: &str,
        updated_by: &str,
    ) -> Result<AgentInstruction, StoreError> {
        let version_key = version::pad(version);
        let now = now_iso();

        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute_batch("BEGIN")?;
        let result = (|| -> Result<AgentInstruction, StoreError> {
            let created_at: Option<String> = guard
                .query_row(
                    "SELECT created_at FROM agent_instructions
                     WHERE agent_id = ?1 AND version_key = ?2
                     ORDER BY created_at ASC LIMIT 1",
                    params![agent_id, version_key],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(created_at) = created_at else {
                return Err(StoreError::VersionNotFound {
                    agent_id: agent_id.to_string(),
                    version: version.to_string(),
                });
            };

            guard.execute(
                "UPDATE agent_instructions
                 SET is_active = 0, updated_by = ?2, updated_at = ?3
                 WHERE agent_id = ?1 AND is_active = 1",
                params![agent_id, updated_by, now],
            )?;
            guard.execute(
                "UPDATE agent_instructions
                 SET is_active = 1, updated_by = ?3, updated_at = ?4
                 WHERE agent_id = ?1 AND created_at = ?2",
                params![agent_id, created_at, updated_by, now],
            )?;

            let rec = guard.query_row(
                &select_sql("WHERE agent_id = ?1 AND created_at = ?2"),
                params![agent_id, created_at],
                row_to_instruction,
            )?;
            Ok(rec)
        })();

        match result {
            Ok(rec) => {
                guard.execute_batch("COMMIT")?;
                Ok(rec)
            }
            Err(e) => {
                let _ = guard.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Get the single active instruction for an agent, if any.
    pub fn get_active_instruction(
        &self,
        agent_id: &str,
    ) -> Result<Option<AgentInstruction>, StoreError> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .query_row(
                &select_sql("WHERE agent_id = ?1 AND is_active = 1 LIMIT 1"),
                params![agent_id],
                row_to_instruction,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Get the instruction with the highest version for an agent, if any.
    pub fn get_latest_version(
        &self,
        agent_id: &str,
    ) -> Result<Option<AgentInstruction>, StoreError> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .query_row(
                &select_sql("WHERE agent_id = ?1 ORDER BY version_key DESC LIMIT 1"),
                params![agent_id],
                row_to_instruction,
            )
            .optional()
            .map_err(Into::into)
    }

    /// List an agent's instructions ordered by creation time.
    pub fn list_by_created_at(
        &self,
        agent_id: &str,
        opts: ListOptions,
    ) -> Result<Vec<AgentInstruction>, StoreError> {
        self.list_ordered(agent_id, "created_at", opts)
    }

    /// List an agent's instructions ordered by version.
    pub fn list_by_version(
        &self,
        agent_id: &str,
        opts: ListOptions,
    ) -> Result<Vec<AgentInstruction>, StoreError> {
        self.list_ordered(agent_id, "version_key", opts)
    }

    /// Point lookup by the primary composite key.
    pub fn get_instruction(
        &self,
        agent_id: &str,
        created_at: &str,
    ) -> Result<Option<AgentInstruction>, StoreError> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .query_row(
                &select_sql("WHERE agent_id = ?1 AND created_at = ?2"),
                params![agent_id, created_at],
                row_to_instruction,
            )
            .optional()
            .map_err(Into::into)
    }

    fn list_ordered(
        &self,
        agent_id: &str,
        sort_column: &str,
        opts: ListOptions,
    ) -> Result<Vec<AgentInstruction>, StoreError> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = select_sql(&format!(
            "WHERE agent_id = ?1 ORDER BY {sort_column} {} LIMIT ?2",
            opts.order.as_sql()
        ));
        // SQLite treats LIMIT -1 as "no limit".
        let limit = opts.limit.map(|l| l as i64).unwrap_or(-1);

        let mut stmt = guard.prepare(&sql)?;
        let rows = stmt.query_map(params![agent_id, limit], row_to_instruction)?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }
}

fn select_sql(tail: &str) -> String {
    format!(
        "SELECT agent_id, created_at, version_key, instruction, is_active,
                change_note, updated_by, updated_at
         FROM agent_instructions {tail}"
    )
}

fn row_to_instruction(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentInstruction> {
    Ok(AgentInstruction {
        agent_id: row.get(0)?,
        created_at: row.get(1)?,
        version: version::unpad(&row.get::<_, String>(2)?),
        instruction: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        change_note: row.get(5)?,
        updated_by: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// RFC 3339 UTC with millisecond precision, e.g. `2026-08-25T09:41:02.417Z`.
/// Lexical order of these strings is chronological order.
fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Pick a `created_at` that is free for this agent. Two creates landing in
/// the same millisecond would otherwise collide on the primary key; bumping
/// by a millisecond preserves insertion order.
fn unique_created_at(conn: &Connection, agent_id: &str) -> Result<String, StoreError> {
    let mut ts = Utc::now();
    loop {
        let candidate = ts.to_rfc3339_opts(SecondsFormat::Millis, true);
        let taken: bool = conn.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM agent_instructions
                 WHERE agent_id = ?1 AND created_at = ?2)",
            params![agent_id, candidate],
            |row| row.get(0),
        )?;
        if !taken {
            return Ok(candidate);
        }
        ts = ts + chrono::Duration::milliseconds(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::types::SortOrder;

    fn new_instruction(agent_id: &str, text: &str, by: &str) -> NewInstruction {
        NewInstruction {
            agent_id: agent_id.into(),
            instruction: text.into(),
            updated_by: by.into(),
            version: None,
            change_note: None,
        }
    }

    fn active_count(store: &InstructionStore, agent_id: &str) -> i64 {
        let guard = store.conn.lock().unwrap();
        guard
            .query_row(
                "SELECT COUNT(*) FROM agent_instructions
                 WHERE agent_id = ?1 AND is_active = 1",
                params![agent_id],
                |r| r.get(0),
            )
            .unwrap()
    }

    #[test]
    fn first_create_defaults_to_version_1_0() {
        let store = InstructionStore::open_in_memory().unwrap();
        let rec = store
            .create_instruction(&new_instruction("agent-1", "Be kind", "alice"))
            .unwrap();
        assert_eq!(rec.version, "1.0");
        assert!(rec.is_active);
        assert_eq!(rec.created_at, rec.updated_at);
    }

    #[test]
    fn auto_versioning_bumps_minor() {
        let store = InstructionStore::open_in_memory().unwrap();
        let first = store
            .create_instruction(&new_instruction("agent-1", "v one", "alice"))
            .unwrap();
        let second = store
            .create_instruction(&new_instruction("agent-1", "v two", "alice"))
            .unwrap();
        assert_eq!(first.version, "1.0");
        assert_eq!(second.version, "1.1");
    }

    #[test]
    fn create_deactivates_previous_active() {
        let store = InstructionStore::open_in_memory().unwrap();
        let first = store
            .create_instruction(&new_instruction("agent-1", "Be kind", "alice"))
            .unwrap();
        let second = store
            .create_instruction(&new_instruction("agent-1", "Be kinder", "alice"))
            .unwrap();

        let old = store
            .get_instruction("agent-1", &first.created_at)
            .unwrap()
            .unwrap();
        assert!(!old.is_active);
        assert!(second.is_active);
        assert_eq!(active_count(&store, "agent-1"), 1);
    }

    #[test]
    fn explicit_version_is_normalized() {
        let store = InstructionStore::open_in_memory().unwrap();
        let rec = store
            .create_instruction(&NewInstruction {
                version: Some("2".into()),
                ..new_instruction("agent-1", "major bump", "alice")
            })
            .unwrap();
        // Missing minor defaults to 0 in the padded form.
        assert_eq!(rec.version, "2.0");
    }

    #[test]
    fn explicit_version_drives_next_auto_bump() {
        let store = InstructionStore::open_in_memory().unwrap();
        store
            .create_instruction(&NewInstruction {
                version: Some("2.0".into()),
                ..new_instruction("agent-1", "major bump", "alice")
            })
            .unwrap();
        let next = store
            .create_instruction(&new_instruction("agent-1", "follow-up", "alice"))
            .unwrap();
        assert_eq!(next.version, "2.1");
    }

    #[test]
    fn activate_switches_the_active_flag() {
        let store = InstructionStore::open_in_memory().unwrap();
        let first = store
            .create_instruction(&new_instruction("agent-1", "Be kind", "alice"))
            .unwrap();
        store
            .create_instruction(&new_instruction("agent-1", "Be kinder", "alice"))
            .unwrap();

        let reactivated = store
            .activate_instruction("agent-1", "1.0", "bob")
            .unwrap();
        assert_eq!(reactivated.version, "1.0");
        assert!(reactivated.is_active);
        assert_eq!(reactivated.updated_by, "bob");
        assert_eq!(reactivated.created_at, first.created_at);

        let active = store.get_active_instruction("agent-1").unwrap().unwrap();
        assert_eq!(active.version, "1.0");
        assert_eq!(active_count(&store, "agent-1"), 1);

        // The 1.1 record is now inactive and carries bob's deactivation.
        let history = store
            .list_by_version("agent-1", ListOptions::default())
            .unwrap();
        let v11 = history.iter().find(|r| r.version == "1.1").unwrap();
        assert!(!v11.is_active);
        assert_eq!(v11.updated_by, "bob");
    }

    #[test]
    fn activate_already_active_version_rewrites_actor() {
        let store = InstructionStore::open_in_memory().unwrap();
        store
            .create_instruction(&new_instruction("agent-1", "Be kind", "alice"))
            .unwrap();
        let rec = store
            .activate_instruction("agent-1", "1.0", "bob")
            .unwrap();
        assert!(rec.is_active);
        assert_eq!(rec.updated_by, "bob");
        assert_eq!(active_count(&store, "agent-1"), 1);
    }

    #[test]
    fn activate_unknown_version_is_domain_error_and_mutates_nothing() {
        let store = InstructionStore::open_in_memory().unwrap();
        store
            .create_instruction(&new_instruction("agent-1", "Be kind", "alice"))
            .unwrap();

        let err = store
            .activate_instruction("agent-1", "9.9", "bob")
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionNotFound { .. }));

        let active = store.get_active_instruction("agent-1").unwrap().unwrap();
        assert_eq!(active.version, "1.0");
        assert_eq!(active.updated_by, "alice");
        assert_eq!(active_count(&store, "agent-1"), 1);
    }

    #[test]
    fn get_active_missing_agent_is_none() {
        let store = InstructionStore::open_in_memory().unwrap();
        assert!(store.get_active_instruction("nobody").unwrap().is_none());
        assert!(store.get_latest_version("nobody").unwrap().is_none());
    }

    #[test]
    fn latest_version_matches_head_of_version_list() {
        let store = InstructionStore::open_in_memory().unwrap();
        for text in ["a", "b", "c"] {
            store
                .create_instruction(&new_instruction("agent-1", text, "alice"))
                .unwrap();
        }
        let latest = store.get_latest_version("agent-1").unwrap().unwrap();
        let listed = store
            .list_by_version("agent-1", ListOptions::default())
            .unwrap();
        assert_eq!(latest.version, listed[0].version);
        assert_eq!(latest.created_at, listed[0].created_at);
    }

    #[test]
    fn version_order_is_numeric_past_single_digits() {
        let store = InstructionStore::open_in_memory().unwrap();
        for v in ["1.2", "1.9", "1.10"] {
            store
                .create_instruction(&NewInstruction {
                    version: Some(v.into()),
                    ..new_instruction("agent-1", v, "alice")
                })
                .unwrap();
        }
        let desc = store
            .list_by_version("agent-1", ListOptions::default())
            .unwrap();
        let versions: Vec<&str> = desc.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["1.10", "1.9", "1.2"]);
        assert_eq!(
            store.get_latest_version("agent-1").unwrap().unwrap().version,
            "1.10"
        );
    }

    #[test]
    fn list_by_created_at_orders_and_limits() {
        let store = InstructionStore::open_in_memory().unwrap();
        for text in ["first", "second", "third"] {
            store
                .create_instruction(&new_instruction("agent-1", text, "alice"))
                .unwrap();
        }

        let desc = store
            .list_by_created_at("agent-1", ListOptions::default())
            .unwrap();
        assert_eq!(desc[0].instruction, "third");
        assert_eq!(desc[2].instruction, "first");

        let asc = store
            .list_by_created_at(
                "agent-1",
                ListOptions {
                    order: SortOrder::Asc,
                    limit: Some(2),
                },
            )
            .unwrap();
        assert_eq!(asc.len(), 2);
        assert_eq!(asc[0].instruction, "first");
    }

    #[test]
    fn lists_are_scoped_per_agent() {
        let store = InstructionStore::open_in_memory().unwrap();
        store
            .create_instruction(&new_instruction("agent-1", "one", "alice"))
            .unwrap();
        store
            .create_instruction(&new_instruction("agent-2", "two", "alice"))
            .unwrap();

        let list = store
            .list_by_created_at("agent-1", ListOptions::default())
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].agent_id, "agent-1");
        assert_eq!(active_count(&store, "agent-1"), 1);
        assert_eq!(active_count(&store, "agent-2"), 1);
    }

    #[test]
    fn point_lookup_roundtrip() {
        let store = InstructionStore::open_in_memory().unwrap();
        let rec = store
            .create_instruction(&new_instruction("agent-1", "Be kind", "alice"))
            .unwrap();
        let got = store
            .get_instruction("agent-1", &rec.created_at)
            .unwrap()
            .unwrap();
        assert_eq!(got.version, "1.0");
        assert_eq!(got.instruction, "Be kind");
        assert!(store
            .get_instruction("agent-1", "2000-01-01T00:00:00.000Z")
            .unwrap()
            .is_none());
    }

    #[test]
    fn rapid_creates_get_distinct_created_at() {
        let store = InstructionStore::open_in_memory().unwrap();
        for i in 0..10 {
            store
                .create_instruction(&new_instruction("agent-1", &format!("rev {i}"), "alice"))
                .unwrap();
        }
        let list = store
            .list_by_created_at("agent-1", ListOptions::default())
            .unwrap();
        assert_eq!(list.len(), 10);
        // created_at is part of the primary key; all must be distinct and
        // the newest revision must be the active one.
        let mut stamps: Vec<&str> = list.iter().map(|r| r.created_at.as_str()).collect();
        stamps.dedup();
        assert_eq!(stamps.len(), 10);
        assert_eq!(list[0].instruction, "rev 9");
        assert!(list[0].is_active);
    }

    #[test]
    fn full_lifecycle_scenario() {
        let store = InstructionStore::open_in_memory().unwrap();

        let v10 = store
            .create_instruction(&new_instruction("agent-1", "Be kind", "alice"))
            .unwrap();
        assert_eq!(v10.version, "1.0");
        assert!(v10.is_active);

        let v11 = store
            .create_instruction(&new_instruction("agent-1", "Be kinder", "alice"))
            .unwrap();
        assert_eq!(v11.version, "1.1");
        assert!(v11.is_active);
        assert!(!store
            .get_instruction("agent-1", &v10.created_at)
            .unwrap()
            .unwrap()
            .is_active);

        store
            .activate_instruction("agent-1", "1.0", "bob")
            .unwrap();
        let active = store.get_active_instruction("agent-1").unwrap().unwrap();
        assert_eq!(active.version, "1.0");
        assert!(!store
            .get_instruction("agent-1", &v11.created_at)
            .unwrap()
            .unwrap()
            .is_active);
        assert_eq!(active_count(&store, "agent-1"), 1);
    }

    #[test]
    fn reopen_preserves_rows() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("instructions.db");
        {
            let store = InstructionStore::open(&db_path).unwrap();
            store
                .create_instruction(&new_instruction("agent-1", "persisted", "alice"))
                .unwrap();
        }
        let store = InstructionStore::open(&db_path).unwrap();
        let active = store.get_active_instruction("agent-1").unwrap().unwrap();
        assert_eq!(active.instruction, "persisted");
    }
}
