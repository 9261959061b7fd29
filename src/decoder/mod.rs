use log::{debug, error};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::tables::TableId;

/// Buffers are zero padded to at least this many bytes before decoding
pub const MIN_PADDED_LEN: usize = 36;

const FIELD_WIDTH: usize = 4;

/// One metric inside a table: the n-th little endian i32 divided by `scale`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldLayout {
    pub index: usize,
    pub key: &'static str,
    pub scale: u32,
}

const fn field(index: usize, key: &'static str, scale: u32) -> FieldLayout {
    FieldLayout { index, key, scale }
}

const ENERGY_TOTALS_LAYOUT: [FieldLayout; 2] = [
    field(0, "Fwd_kWh", 1000),
    field(1, "Rev_kWh", 1000),
];

// Indices 2 and 3 are not used by the meter for anything we publish
const INSTANTANEOUS_LAYOUT: [FieldLayout; 8] = [
    field(0, "fwd_Now", 1),
    field(1, "rev_Now", 1),
    field(4, "L1_A", 1000),
    field(5, "L2_A", 1000),
    field(6, "L3_A", 1000),
    field(7, "L1_V", 1000),
    field(8, "L2_V", 1000),
    field(9, "L3_V", 1000),
];

impl TableId {
    pub fn layout(&self) -> &'static [FieldLayout] {
        match self {
            TableId::EnergyTotals => &ENERGY_TOTALS_LAYOUT,
            TableId::Instantaneous => &INSTANTANEOUS_LAYOUT,
        }
    }

    /// Bytes needed to read every field of the layout
    pub fn required_len(&self) -> usize {
        let max_index = self.layout().iter().map(|f| f.index).max().unwrap_or(0);
        std::cmp::max(MIN_PADDED_LEN, (max_index + 1) * FIELD_WIDTH)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("Field {index} is beyond the {len} bytes of the buffer")]
    FieldOutOfRange { index: usize, len: usize },
}

/// Decodes a raw table buffer into metric name -> value.
///
/// Unknown tables and decode failures yield an empty map.
pub fn decode(table_id: u16, buffer: &[u8]) -> Map<String, Value> {
    let table = match TableId::from_raw(table_id) {
        Some(t) => t,
        None => {
            debug!("No field layout for table {}, ignoring it", table_id);
            return Map::new();
        }
    };

    let mut padded = buffer.to_vec();
    if padded.len() < table.required_len() {
        padded.resize(table.required_len(), 0);
    }

    match decode_fields(table.layout(), &padded) {
        Ok(values) => {
            debug!("Parsed data for table {}: {:?}", table_id, values);
            values
        }
        Err(e) => {
            error!("Error decoding table {}: {}", table_id, e);
            Map::new()
        }
    }
}

fn decode_fields(layout: &[FieldLayout], buffer: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    let mut values = Map::new();
    for f in layout {
        let raw = read_i32_le(buffer, f.index)?;
        let value = if f.scale == 1 {
            Value::from(raw as i64)
        } else {
            Value::from(raw as f64 / f.scale as f64)
        };
        values.insert(f.key.to_string(), value);
    }
    Ok(values)
}

fn read_i32_le(buffer: &[u8], index: usize) -> Result<i32, DecodeError> {
    let start = index * FIELD_WIDTH;
    let bytes: [u8; FIELD_WIDTH] = buffer.get(start..start + FIELD_WIDTH)
        .and_then(|b| b.try_into().ok())
        .ok_or(DecodeError::FieldOutOfRange { index, len: buffer.len() })?;
    Ok(i32::from_le_bytes(bytes))
}
