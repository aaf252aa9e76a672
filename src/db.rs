use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::Connection;

/// Column name → scalar value. Always carries the entity ID column.
pub type Record = BTreeMap<String, Value>;

pub fn connect(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS identificacion (
            cvlac_id          TEXT PRIMARY KEY NOT NULL,
            nombre            TEXT NOT NULL,
            nombre_citaciones TEXT,
            nacionalidad      TEXT,
            sexo              TEXT,
            categoria         TEXT,
            updated_at        TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS formacion_academica (
            cvlac_id     TEXT NOT NULL,
            nivel        TEXT,
            institucion  TEXT NOT NULL,
            programa     TEXT NOT NULL,
            ano_inicio   INTEGER,
            ano_fin      INTEGER,
            tesis        TEXT,
            PRIMARY KEY (cvlac_id, institucion, programa)
        );

        CREATE TABLE IF NOT EXISTS experiencia (
            cvlac_id     TEXT NOT NULL,
            institucion  TEXT NOT NULL,
            cargo        TEXT,
            dedicacion   TEXT,
            ano_inicio   INTEGER,
            ano_fin      INTEGER,
            PRIMARY KEY (cvlac_id, institucion)
        );

        CREATE TABLE IF NOT EXISTS idiomas (
            cvlac_id  TEXT NOT NULL,
            idioma    TEXT NOT NULL,
            habla     TEXT,
            escribe   TEXT,
            lee       TEXT,
            entiende  TEXT,
            PRIMARY KEY (cvlac_id, idioma)
        );

        CREATE TABLE IF NOT EXISTS areas_actuacion (
            cvlac_id  TEXT NOT NULL,
            area      TEXT NOT NULL,
            PRIMARY KEY (cvlac_id, area)
        );

        CREATE TABLE IF NOT EXISTS lineas_investigacion (
            cvlac_id  TEXT NOT NULL,
            linea     TEXT NOT NULL,
            activa    TEXT,
            PRIMARY KEY (cvlac_id, linea)
        );

        CREATE TABLE IF NOT EXISTS premios (
            cvlac_id  TEXT NOT NULL,
            nombre    TEXT NOT NULL,
            entidad   TEXT,
            fecha     TEXT,
            PRIMARY KEY (cvlac_id, nombre)
        );

        CREATE TABLE IF NOT EXISTS articulos (
            cvlac_id   TEXT NOT NULL,
            titulo     TEXT NOT NULL,
            autores    TEXT,
            pais       TEXT,
            revista    TEXT,
            issn       TEXT,
            volumen    INTEGER,
            fasciculo  TEXT,
            paginas    TEXT,
            ano        INTEGER,
            doi        TEXT,
            PRIMARY KEY (cvlac_id, titulo)
        );
        CREATE INDEX IF NOT EXISTS idx_articulos_ano ON articulos(ano);

        CREATE TABLE IF NOT EXISTS libros (
            cvlac_id   TEXT NOT NULL,
            titulo     TEXT NOT NULL,
            autores    TEXT,
            pais       TEXT,
            editorial  TEXT,
            isbn       TEXT,
            ano        INTEGER,
            PRIMARY KEY (cvlac_id, titulo)
        );

        CREATE TABLE IF NOT EXISTS capitulos_libro (
            cvlac_id         TEXT NOT NULL,
            titulo_capitulo  TEXT NOT NULL,
            titulo_libro     TEXT,
            autores          TEXT,
            pais             TEXT,
            editorial        TEXT,
            isbn             TEXT,
            paginas          TEXT,
            ano              INTEGER,
            PRIMARY KEY (cvlac_id, titulo_capitulo)
        );

        CREATE TABLE IF NOT EXISTS eventos (
            cvlac_id       TEXT NOT NULL,
            nombre_evento  TEXT NOT NULL,
            tipo           TEXT,
            ambito         TEXT,
            fecha          TEXT,
            lugar          TEXT,
            rol            TEXT,
            PRIMARY KEY (cvlac_id, nombre_evento)
        );

        CREATE TABLE IF NOT EXISTS proyectos (
            cvlac_id    TEXT NOT NULL,
            titulo      TEXT NOT NULL,
            tipo        TEXT,
            ano_inicio  INTEGER,
            ano_fin     INTEGER,
            resumen     TEXT,
            PRIMARY KEY (cvlac_id, titulo)
        );
        ",
    )?;
    Ok(())
}

// ── Stats ──

/// Row count per table, for the tables that exist.
pub fn table_counts(conn: &Connection, tables: &[&str]) -> Result<Vec<(String, usize)>> {
    let mut counts = Vec::with_capacity(tables.len());
    for table in tables {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table],
            |r| r.get(0),
        )?;
        if !exists {
            continue;
        }
        let n: usize = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |r| r.get(0),
        )?;
        counts.push((table.to_string(), n));
    }
    Ok(counts)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// JSON rendering of a record, for dry runs.
pub fn record_to_json(record: &Record) -> serde_json::Value {
    let map = record
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::Null => serde_json::Value::Null,
                Value::Integer(i) => serde_json::Value::from(*i),
                Value::Real(f) => serde_json::Value::from(*f),
                Value::Text(s) => serde_json::Value::from(s.as_str()),
                Value::Blob(b) => serde_json::Value::from(format!("<{} bytes>", b.len())),
            };
            (k.clone(), v)
        })
        .collect();
    serde_json::Value::Object(map)
}
