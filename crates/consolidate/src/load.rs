//! CSV loading for the dimension and fact tables.

use std::collections::BTreeMap;

use crate::config::{EntitySource, FactSource};
use crate::error::ConsolidateError;
use crate::model::{Entity, FactRecord};

fn reader(csv_data: &[u8]) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(csv_data)
}

fn headers(rdr: &mut csv::Reader<&[u8]>, source: &str) -> Result<Vec<String>, ConsolidateError> {
    let raw = rdr
        .byte_headers()
        .map_err(|e| ConsolidateError::Io(format!("{source}: {e}")))?;
    raw.iter()
        .map(|h| {
            std::str::from_utf8(h)
                .map(|s| s.trim().to_string())
                .map_err(|_| ConsolidateError::Io(format!("{source}: header is not valid UTF-8")))
        })
        .collect()
}

fn column(headers: &[String], source: &str, name: &str) -> Result<usize, ConsolidateError> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| ConsolidateError::MissingColumn {
            source: source.into(),
            column: name.into(),
        })
}

fn field(record: &csv::ByteRecord, i: usize) -> Result<String, std::str::Utf8Error> {
    std::str::from_utf8(record.get(i).unwrap_or(b"")).map(str::to_string)
}

/// Load dimension rows. Columns other than id and name become attributes.
///
/// A name that is not valid UTF-8 is a normalization failure for that entity.
pub fn load_csv_entities(csv_data: &[u8], source: &EntitySource) -> Result<Vec<Entity>, ConsolidateError> {
    let label = source.file.as_str();
    let mut rdr = reader(csv_data);
    let headers = headers(&mut rdr, label)?;
    let id_idx = column(&headers, label, &source.columns.id)?;
    let name_idx = column(&headers, label, &source.columns.name)?;

    let mut entities = Vec::new();
    for (row, record) in rdr.byte_records().enumerate() {
        let record = record.map_err(|e| ConsolidateError::Io(format!("{label}: {e}")))?;
        let line = row + 2;
        let id = field(&record, id_idx)
            .map_err(|_| ConsolidateError::Io(format!("{label}:{line}: id is not valid UTF-8")))?
            .trim()
            .to_string();
        let name = field(&record, name_idx).map_err(|e| ConsolidateError::Normalization {
            entity_id: id.clone(),
            reason: format!("name is not valid UTF-8 ({e})"),
        })?;

        let mut attributes = BTreeMap::new();
        for (i, header) in headers.iter().enumerate() {
            if i == id_idx || i == name_idx {
                continue;
            }
            let value = field(&record, i).map_err(|_| {
                ConsolidateError::Io(format!("{label}:{line}: column '{header}' is not valid UTF-8"))
            })?;
            attributes.insert(header.clone(), value);
        }

        entities.push(Entity { id, name, attributes });
    }

    log::debug!("{label}: loaded {} entity row(s)", entities.len());
    Ok(entities)
}

/// Load fact rows. The record id column is held apart from `fields`;
/// without one the 1-based row number is used.
pub fn load_csv_facts(csv_data: &[u8], source: &FactSource) -> Result<Vec<FactRecord>, ConsolidateError> {
    let label = source.file.as_str();
    let mut rdr = reader(csv_data);
    let headers = headers(&mut rdr, label)?;

    let record_id_idx = match &source.record_id {
        Some(col) => Some(column(&headers, label, col)?),
        None => None,
    };
    for fk in &source.foreign_keys {
        column(&headers, label, &fk.field)?;
        if let Some(name_field) = &fk.name_field {
            column(&headers, label, name_field)?;
        }
    }

    let mut facts = Vec::new();
    for (row, record) in rdr.byte_records().enumerate() {
        let record = record.map_err(|e| ConsolidateError::Io(format!("{label}: {e}")))?;
        let line = row + 2;
        let mut record_id = (row + 1).to_string();
        let mut fields = BTreeMap::new();
        for (i, header) in headers.iter().enumerate() {
            let value = field(&record, i).map_err(|_| {
                ConsolidateError::Io(format!("{label}:{line}: column '{header}' is not valid UTF-8"))
            })?;
            if Some(i) == record_id_idx {
                record_id = value;
            } else {
                fields.insert(header.clone(), value.trim().to_string());
            }
        }
        facts.push(FactRecord { record_id, fields });
    }

    log::debug!("{label}: loaded {} fact record(s)", facts.len());
    Ok(facts)
}
