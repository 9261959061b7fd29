use std::time::Duration;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::SourceConfig;

pub mod file_source;

/// Tables of the meter we know how to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableId {
    /// Cumulative energy import and export
    EnergyTotals,
    /// Instantaneous power, phase currents and phase voltages
    Instantaneous,
}

impl TableId {
    pub fn from_raw(id: u16) -> Option<Self> {
        match id {
            23 => Some(TableId::EnergyTotals),
            28 => Some(TableId::Instantaneous),
            _ => None,
        }
    }

    pub fn raw(&self) -> u16 {
        match self {
            TableId::EnergyTotals => 23,
            TableId::Instantaneous => 28,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDescriptor {
    pub id: u16,
    pub offset: usize,
    pub length: usize,
}

/// The tables read on every poll, in this order
pub const POLLED_TABLES: [TableDescriptor; 2] = [
    TableDescriptor { id: 23, offset: 0, length: 8 },
    TableDescriptor { id: 28, offset: 0, length: 40 },
];

#[derive(Error, Debug)]
pub enum TableSourceError {
    #[error("Table {0} is not available")]
    NotAvailable(u16),
    #[error("Offset {offset} is beyond the {available} bytes of table {table_id}")]
    OutOfRange { table_id: u16, offset: usize, available: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Table dump is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("{0}")]
    Transport(String),
}

/// Something that yields the raw bytes of a meter table.
///
/// Implementations own the single link to the meter, so they are only ever
/// used from one task at a time.
pub trait TableSource {
    fn get_table_part(&mut self, table_id: u16, length: usize, offset: usize) -> Result<Vec<u8>, TableSourceError>;
}

#[derive(Error, Debug)]
#[error("Reading table {table_id} failed: {source}")]
pub struct ReadError {
    pub table_id: u16,
    #[source]
    pub source: TableSourceError,
}

pub struct TableReader<S: TableSource> {
    source: S,
    retries: u32,
    retry_delay: Duration,
}

impl<S: TableSource> TableReader<S> {
    pub fn new(source: S, config: &SourceConfig) -> Self {
        return TableReader {
            source,
            retries: config.read_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        };
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn read(&mut self, descriptor: &TableDescriptor) -> Result<Vec<u8>, ReadError> {
        let mut attempt = 0;

        loop {
            match self.source.get_table_part(descriptor.id, descriptor.length, descriptor.offset) {
                Ok(data) => {
                    info!("Read {} bytes from table {}", data.len(), descriptor.id);
                    debug!("Table {} raw: {}", descriptor.id, hex::encode(&data));
                    return Ok(data);
                }
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!("Reading table {} failed, retrying ({}/{}): {}",
                          descriptor.id, attempt, self.retries, e);
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!("Reading table {} failed: {}", descriptor.id, e);
                    return Err(ReadError { table_id: descriptor.id, source: e });
                }
            }
        }
    }
}
