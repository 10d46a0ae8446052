// Consolidated tables in a SQLite database

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;

use rusqlite::{params, Connection};

use conform_consolidate::model::ChangeEntry;
use conform_consolidate::{AuditEntry, ConsolidateError, ConsolidateInput, Entity, FactRecord, Sink};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dim_entities (
    seq INTEGER PRIMARY KEY,       -- row order as written
    entity_id TEXT NOT NULL,
    name TEXT NOT NULL,
    attributes TEXT NOT NULL       -- JSON object
);

CREATE TABLE IF NOT EXISTS fact_records (
    seq INTEGER PRIMARY KEY,
    record_id TEXT NOT NULL,
    fields TEXT NOT NULL           -- JSON object
);

CREATE TABLE IF NOT EXISTS consolidation_changes (
    field TEXT NOT NULL,
    old_id TEXT NOT NULL,
    new_id TEXT NOT NULL,
    affected_count INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS consolidation_audit (
    seq INTEGER NOT NULL,
    timestamp TEXT NOT NULL,       -- RFC 3339
    operation TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    field TEXT NOT NULL,
    before_value TEXT NOT NULL,
    after_value TEXT NOT NULL
);
"#;

fn sink_err(e: impl Display) -> ConsolidateError {
    ConsolidateError::Sink(e.to_string())
}

/// Sink backed by one SQLite connection. `begin`/`commit`/`rollback` map
/// directly onto SQL transactions; dimension and fact tables are replaced
/// wholesale, change and audit tables are appended to.
pub struct SqliteSink {
    conn: Connection,
    in_tx: bool,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self, ConsolidateError> {
        let conn = Connection::open(path).map_err(sink_err)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, ConsolidateError> {
        let conn = Connection::open_in_memory().map_err(sink_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, ConsolidateError> {
        conn.execute_batch(SCHEMA).map_err(sink_err)?;
        Ok(Self { conn, in_tx: false })
    }

    fn require_tx(&self) -> Result<(), ConsolidateError> {
        if self.in_tx {
            Ok(())
        } else {
            Err(ConsolidateError::Sink("write outside a transaction".into()))
        }
    }

    /// Committed dimension in row order.
    pub fn load_entities(&self) -> Result<Vec<Entity>, ConsolidateError> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity_id, name, attributes FROM dim_entities ORDER BY seq")
            .map_err(sink_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(sink_err)?;

        let mut entities = Vec::new();
        for row in rows {
            let (id, name, attributes) = row.map_err(sink_err)?;
            let attributes: BTreeMap<String, String> =
                serde_json::from_str(&attributes).map_err(sink_err)?;
            entities.push(Entity { id, name, attributes });
        }
        Ok(entities)
    }

    pub fn load_facts(&self) -> Result<Vec<FactRecord>, ConsolidateError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record_id, fields FROM fact_records ORDER BY seq")
            .map_err(sink_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(sink_err)?;

        let mut facts = Vec::new();
        for row in rows {
            let (record_id, fields) = row.map_err(sink_err)?;
            let fields: BTreeMap<String, String> = serde_json::from_str(&fields).map_err(sink_err)?;
            facts.push(FactRecord { record_id, fields });
        }
        Ok(facts)
    }

    /// Committed dimension and facts, ready to feed another run.
    pub fn load_input(&self) -> Result<ConsolidateInput, ConsolidateError> {
        Ok(ConsolidateInput {
            entities: self.load_entities()?,
            facts: self.load_facts()?,
        })
    }

    pub fn load_changes(&self) -> Result<Vec<ChangeEntry>, ConsolidateError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT field, old_id, new_id, affected_count FROM consolidation_changes ORDER BY rowid",
            )
            .map_err(sink_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ChangeEntry {
                    field: row.get(0)?,
                    old_id: row.get(1)?,
                    new_id: row.get(2)?,
                    affected_count: row.get::<_, i64>(3)? as usize,
                })
            })
            .map_err(sink_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sink_err)
    }

    pub fn audit_count(&self) -> Result<usize, ConsolidateError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM consolidation_audit", [], |row| row.get(0))
            .map_err(sink_err)?;
        Ok(n as usize)
    }
}

impl Sink for SqliteSink {
    fn begin(&mut self) -> Result<(), ConsolidateError> {
        if self.in_tx {
            return Err(ConsolidateError::Sink("transaction already open".into()));
        }
        self.conn.execute("BEGIN TRANSACTION", []).map_err(sink_err)?;
        self.in_tx = true;
        Ok(())
    }

    fn write_entities(&mut self, entities: &[Entity]) -> Result<(), ConsolidateError> {
        self.require_tx()?;
        self.conn.execute("DELETE FROM dim_entities", []).map_err(sink_err)?;
        let mut stmt = self
            .conn
            .prepare("INSERT INTO dim_entities (entity_id, name, attributes) VALUES (?1, ?2, ?3)")
            .map_err(sink_err)?;
        for e in entities {
            let attributes = serde_json::to_string(&e.attributes).map_err(sink_err)?;
            stmt.execute(params![e.id, e.name, attributes]).map_err(sink_err)?;
        }
        log::debug!("sqlite: staged {} dimension row(s)", entities.len());
        Ok(())
    }

    fn write_facts(&mut self, facts: &[FactRecord]) -> Result<(), ConsolidateError> {
        self.require_tx()?;
        self.conn.execute("DELETE FROM fact_records", []).map_err(sink_err)?;
        let mut stmt = self
            .conn
            .prepare("INSERT INTO fact_records (record_id, fields) VALUES (?1, ?2)")
            .map_err(sink_err)?;
        for f in facts {
            let fields = serde_json::to_string(&f.fields).map_err(sink_err)?;
            stmt.execute(params![f.record_id, fields]).map_err(sink_err)?;
        }
        log::debug!("sqlite: staged {} fact record(s)", facts.len());
        Ok(())
    }

    fn write_changes(&mut self, changes: &[ChangeEntry]) -> Result<(), ConsolidateError> {
        self.require_tx()?;
        let mut stmt = self
            .conn
            .prepare(
                "INSERT INTO consolidation_changes (field, old_id, new_id, affected_count) VALUES (?1, ?2, ?3, ?4)",
            )
            .map_err(sink_err)?;
        for c in changes {
            stmt.execute(params![c.field, c.old_id, c.new_id, c.affected_count as i64])
                .map_err(sink_err)?;
        }
        Ok(())
    }

    fn write_audit(&mut self, entries: &[AuditEntry]) -> Result<(), ConsolidateError> {
        self.require_tx()?;
        let mut stmt = self
            .conn
            .prepare(
                "INSERT INTO consolidation_audit (seq, timestamp, operation, subject_id, field, before_value, after_value) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(sink_err)?;
        for a in entries {
            stmt.execute(params![
                a.seq as i64,
                a.timestamp.to_rfc3339(),
                a.operation.to_string(),
                a.subject_id,
                a.field,
                a.before_value,
                a.after_value
            ])
            .map_err(sink_err)?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ConsolidateError> {
        self.require_tx()?;
        self.conn.execute("COMMIT", []).map_err(sink_err)?;
        self.in_tx = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ConsolidateError> {
        if !self.in_tx {
            return Ok(());
        }
        self.in_tx = false;
        self.conn.execute("ROLLBACK", []).map_err(sink_err)?;
        Ok(())
    }
}
