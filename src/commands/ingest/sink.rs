use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::types::{Null, ToSqlOutput};
use rusqlite::{Connection, ToSql, Transaction, params_from_iter};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::aggregate::alternatives_cell;
use crate::model::{ErrorEntry, StoreRecord};
use crate::util::{ensure_directory, write_file_atomic, write_json_pretty};

pub const TABLE_NAME: &str = "tiendas";
pub const ERROR_TABLE_NAME: &str = "errores";

const UTF8_BOM: &str = "\u{FEFF}";

/// Column order of the tabular outputs.
pub const TABULAR_COLUMNS: [&str; 35] = [
    "Año",
    "Ciudad",
    "ID_Tienda",
    "Nombre_Tienda",
    "Latitud_KMZ",
    "Longitud_KMZ",
    "Nombre_Obra_PDF",
    "Ubicacion_Detallada",
    "Laboratorio",
    "Fecha_Reporte",
    "Cantidad_Sondeos",
    "Metodologia",
    "Profundidad_Max_Explorada_m",
    "Presencia_NAF",
    "Profundidad_NAF_m",
    "Tipo_Suelo_Predominante",
    "Clasificacion_SUCS",
    "Consistencia_Densidad",
    "Limite_Liquido_LL",
    "Indice_Plasticidad_IP",
    "Contenido_Agua_Promedio",
    "Alternativas_Cimentacion_JSON",
    "Tipo_Cimentacion_Recomendado",
    "Qadm_Recomendado_ton_m2",
    "Profundidad_Desplante_m",
    "Justificacion_Recomendacion",
    "Mejoramiento_Requerido",
    "Detalles_Mejoramiento",
    "Zona_Sismica",
    "Coeficiente_Sismico",
    "Clasificacion_Sitio",
    "Observaciones_Criticas",
    "Archivo_KMZ",
    "Archivo_PDF",
    "Error_Procesamiento",
];

pub const ERROR_COLUMNS: [&str; 3] = ["tienda", "identidad", "error"];

/// Locations of every artifact derived from one output stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub structural: PathBuf,
    pub sqlite: PathBuf,
    pub csv: PathBuf,
    pub errors: PathBuf,
}

impl OutputPaths {
    pub fn new(output_dir: &Path, stem: &str) -> Self {
        Self {
            structural: output_dir.join(format!("{stem}.json")),
            sqlite: output_dir.join(format!("{stem}.sqlite")),
            csv: output_dir.join(format!("{stem}.csv")),
            errors: output_dir.join(format!("{stem}_errores.csv")),
        }
    }
}

/// A single tabular value, shared by the SQLite and CSV writers.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    fn from_json(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Empty,
            Some(Value::Bool(flag)) => Self::Bool(*flag),
            Some(Value::Number(number)) => match number.as_i64() {
                Some(integer) => Self::Integer(integer),
                None => number.as_f64().map(Self::Real).unwrap_or(Self::Empty),
            },
            Some(Value::String(text)) => Self::Text(text.clone()),
            Some(other) => Self::Text(other.to_string()),
        }
    }

    fn from_text(value: Option<&str>) -> Self {
        match value {
            Some(text) => Self::Text(text.to_string()),
            None => Self::Empty,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => Ok(()),
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Integer(integer) => write!(f, "{integer}"),
            Self::Real(real) => write!(f, "{real}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Empty => ToSqlOutput::from(Null),
            Self::Bool(flag) => ToSqlOutput::from(*flag),
            Self::Integer(integer) => ToSqlOutput::from(*integer),
            Self::Real(real) => ToSqlOutput::from(*real),
            Self::Text(text) => ToSqlOutput::from(text.as_str()),
        })
    }
}

/// Flattens a record into [`TABULAR_COLUMNS`] order.
pub fn tabular_row(record: &StoreRecord) -> Result<Vec<Cell>> {
    let json = |value: &Option<Value>| Cell::from_json(value.as_ref());

    Ok(vec![
        Cell::Text(record.year.clone()),
        Cell::Text(record.city.clone()),
        Cell::Text(record.store_id.clone()),
        Cell::Text(record.store_name.clone()),
        record.latitude.map(Cell::Real).unwrap_or(Cell::Empty),
        record.longitude.map(Cell::Real).unwrap_or(Cell::Empty),
        json(&record.work_name),
        json(&record.detailed_location),
        json(&record.laboratory),
        json(&record.report_date),
        json(&record.boring_count),
        json(&record.methodology),
        json(&record.max_explored_depth_m),
        json(&record.groundwater_present),
        json(&record.groundwater_depth_m),
        json(&record.predominant_soil),
        json(&record.uscs_class),
        json(&record.consistency),
        json(&record.liquid_limit),
        json(&record.plasticity_index),
        json(&record.average_water_content),
        Cell::from_text(alternatives_cell(&record.alternatives)?.as_deref()),
        json(&record.recommended_type),
        json(&record.recommended_capacity_ton_m2),
        json(&record.recommended_depth_m),
        json(&record.recommendation_justification),
        json(&record.improvement_required),
        json(&record.improvement_details),
        json(&record.seismic_zone),
        json(&record.seismic_coefficient),
        json(&record.site_class),
        json(&record.critical_observations),
        Cell::from_text(record.geodata_file.as_deref()),
        Cell::from_text(record.report_file.as_deref()),
        Cell::from_text(record.error.as_deref()),
    ])
}

/// Rewrites every output artifact from the full in-memory collection.
pub struct PersistenceSink {
    paths: OutputPaths,
    connection: Option<Connection>,
}

impl PersistenceSink {
    pub fn new(paths: OutputPaths) -> Self {
        Self {
            paths,
            connection: None,
        }
    }

    pub fn persist(&mut self, records: &[StoreRecord], errors: &[ErrorEntry]) -> Result<()> {
        if records.is_empty() {
            warn!("no records to persist");
            return Ok(());
        }

        write_json_pretty(&self.paths.structural, records)?;

        let rows = records
            .iter()
            .map(tabular_row)
            .collect::<Result<Vec<Vec<Cell>>>>()?;
        let error_rows: Vec<Vec<Cell>> = errors
            .iter()
            .map(|entry| {
                vec![
                    Cell::Text(entry.store.clone()),
                    Cell::Text(entry.identity.clone()),
                    Cell::Text(entry.reason.clone()),
                ]
            })
            .collect();

        self.write_sqlite(&rows, &error_rows)?;
        write_file_atomic(&self.paths.csv, render_csv(&TABULAR_COLUMNS, &rows).as_bytes())?;
        if !error_rows.is_empty() {
            write_file_atomic(
                &self.paths.errors,
                render_csv(&ERROR_COLUMNS, &error_rows).as_bytes(),
            )?;
        }

        debug!(
            records = records.len(),
            errors = errors.len(),
            path = %self.paths.structural.display(),
            "persisted results"
        );
        Ok(())
    }

    fn write_sqlite(&mut self, rows: &[Vec<Cell>], error_rows: &[Vec<Cell>]) -> Result<()> {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => open_database(&self.paths.sqlite)?,
        };
        let connection = self.connection.insert(connection);

        let tx = connection
            .transaction()
            .context("failed to start sqlite transaction")?;
        replace_table(&tx, TABLE_NAME, &TABULAR_COLUMNS, rows)?;
        replace_table(&tx, ERROR_TABLE_NAME, &ERROR_COLUMNS, error_rows)?;
        tx.commit().context("failed to commit tabular rows")?;
        Ok(())
    }
}

/// Drops `table` and refills it with `rows`, inside the caller's transaction.
fn replace_table(
    tx: &Transaction<'_>,
    table: &str,
    columns: &[&str],
    rows: &[Vec<Cell>],
) -> Result<()> {
    let column_defs = columns
        .iter()
        .map(|column| quote_identifier(column))
        .collect::<Vec<String>>()
        .join(", ");
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {table};
         CREATE TABLE {table} ({column_defs});"
    ))
    .with_context(|| format!("failed to recreate table {table}"))?;

    let placeholders = (1..=columns.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<String>>()
        .join(", ");
    let mut statement = tx
        .prepare(&format!("INSERT INTO {table} VALUES ({placeholders})"))
        .with_context(|| format!("failed to prepare insert into {table}"))?;
    for row in rows {
        statement
            .execute(params_from_iter(row.iter()))
            .with_context(|| format!("failed to insert row into {table}"))?;
    }
    Ok(())
}

/// Error entries persisted by earlier runs. A missing database or table
/// means there are none.
pub fn load_error_entries(sqlite_path: &Path) -> Vec<ErrorEntry> {
    if !sqlite_path.exists() {
        return Vec::new();
    }

    match read_error_table(sqlite_path) {
        Ok(entries) => {
            debug!(entries = entries.len(), "loaded previous error entries");
            entries
        }
        Err(err) => {
            warn!(path = %sqlite_path.display(), error = %format!("{err:#}"), "previous error entries unavailable");
            Vec::new()
        }
    }
}

fn read_error_table(sqlite_path: &Path) -> Result<Vec<ErrorEntry>> {
    let connection = Connection::open(sqlite_path)
        .with_context(|| format!("failed to open sqlite database: {}", sqlite_path.display()))?;
    let exists: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [ERROR_TABLE_NAME],
            |row| row.get(0),
        )
        .context("failed to look up error table")?;
    if exists == 0 {
        return Ok(Vec::new());
    }

    let mut statement = connection
        .prepare(&format!(
            "SELECT tienda, identidad, error FROM {ERROR_TABLE_NAME} ORDER BY rowid"
        ))
        .context("failed to prepare error query")?;
    let entries = statement
        .query_map([], |row| {
            Ok(ErrorEntry {
                store: row.get(0)?,
                identity: row.get(1)?,
                reason: row.get(2)?,
            })
        })
        .context("failed to query error entries")?
        .collect::<rusqlite::Result<Vec<ErrorEntry>>>()
        .context("failed to read error entry")?;
    Ok(entries)
}

fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        ensure_directory(parent)?;
    }

    let connection = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database: {}", path.display()))?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;

    info!(path = %path.display(), "opened tabular database");
    Ok(connection)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn render_csv(header: &[&str], rows: &[Vec<Cell>]) -> String {
    let mut out = String::from(UTF8_BOM);
    out.push_str(
        &header
            .iter()
            .map(|name| escape_csv_cell(name))
            .collect::<Vec<String>>()
            .join(","),
    );
    out.push('\n');

    for row in rows {
        out.push_str(
            &row.iter()
                .map(|cell| escape_csv_cell(&cell.to_string()))
                .collect::<Vec<String>>()
                .join(","),
        );
        out.push('\n');
    }

    out
}

pub fn escape_csv_cell(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
