//! # Append-only Record Stores
//!
//! Implementations of [`PrisonStore`] and [`ScriptArchive`]:
//!
//! | Store              | Backing                      | Use                     |
//! |--------------------|------------------------------|-------------------------|
//! | `JsonLinesStore<T>`| one JSON document per line   | production              |
//! | `InMemoryStore<T>` | `Vec<T>` behind a mutex      | tests and simulations   |
//!
//! A missing file loads as empty. Appends are flushed before returning.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use bitcoin::ScriptBuf;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::Inmate;
use crate::error::StoreError;
use crate::ports::outbound::{PrisonStore, ScriptArchive};

pub struct JsonLinesStore<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonLinesStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<T>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| StoreError::Corrupt {
                line: index + 1,
                reason: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }

    fn append_all(&self, records: &[T]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&buffer)?;
        file.flush()?;
        Ok(())
    }
}

impl PrisonStore for JsonLinesStore<Inmate> {
    fn load(&self) -> Result<Vec<Inmate>, StoreError> {
        self.read_all()
    }

    fn append(&self, inmates: &[Inmate]) -> Result<(), StoreError> {
        self.append_all(inmates)
    }
}

impl ScriptArchive for JsonLinesStore<ScriptBuf> {
    fn load(&self) -> Result<Vec<ScriptBuf>, StoreError> {
        self.read_all()
    }

    fn append(&self, scripts: &[ScriptBuf]) -> Result<(), StoreError> {
        self.append_all(scripts)
    }
}

pub struct InMemoryStore<T> {
    records: Mutex<Vec<T>>,
}

impl<T: Clone> InMemoryStore<T> {
    pub fn new() -> Self {
        Self::with_records(Vec::new())
    }

    pub fn with_records(records: Vec<T>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub fn records(&self) -> Vec<T> {
        self.records.lock().clone()
    }
}

impl<T: Clone> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl PrisonStore for InMemoryStore<Inmate> {
    fn load(&self) -> Result<Vec<Inmate>, StoreError> {
        Ok(self.records())
    }

    fn append(&self, inmates: &[Inmate]) -> Result<(), StoreError> {
        self.records.lock().extend_from_slice(inmates);
        Ok(())
    }
}

impl ScriptArchive for InMemoryStore<ScriptBuf> {
    fn load(&self) -> Result<Vec<ScriptBuf>, StoreError> {
        Ok(self.records())
    }

    fn append(&self, scripts: &[ScriptBuf]) -> Result<(), StoreError> {
        self.records.lock().extend_from_slice(scripts);
        Ok(())
    }
}
