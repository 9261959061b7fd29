use std::fs;
use std::path::PathBuf;
use log::debug;

use super::{TableSource, TableSourceError};

/// Replays table dumps stored as hex text, one file per table: `table_<id>.hex`
pub struct FileTableSource {
    dir: PathBuf,
}

impl FileTableSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn table_path(&self, table_id: u16) -> PathBuf {
        self.dir.join(format!("table_{}.hex", table_id))
    }
}

impl TableSource for FileTableSource {
    fn get_table_part(&mut self, table_id: u16, length: usize, offset: usize) -> Result<Vec<u8>, TableSourceError> {
        let path = self.table_path(table_id);
        if !path.exists() {
            return Err(TableSourceError::NotAvailable(table_id));
        }

        debug!("Loading dump of table {} from {}", table_id, path.display());
        let text = fs::read_to_string(&path)?;
        let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let data = hex::decode(cleaned)?;

        if offset > data.len() {
            return Err(TableSourceError::OutOfRange { table_id, offset, available: data.len() });
        }

        let end = std::cmp::min(offset + length, data.len());
        Ok(data[offset..end].to_vec())
    }
}
