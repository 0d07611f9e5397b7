//! Resolution of the trace's cross-reference tables against the database.
//!
//! The front-end records images, files, functions, source locations and
//! access details with intra-trace indices. Loading interns each row
//! through the writer (re-using rows a previous pass already stored) and
//! produces index→row maps for the consumers. Filtered entries resolve to
//! [`Resolved::Filtered`]; records reaching them are skipped.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::config::ConflictIgnore;
use crate::domain::{
    FileId, Function, FunctionId, ImageId, LocationId, SourceLocation, TraceError,
};
use crate::filter::Filter;
use crate::storage::SqlWriter;

use super::reader::RawTables;

/// A source location with its database ids resolved.
#[derive(Debug, Clone, Copy)]
pub struct LocationDetails {
    pub id: LocationId,
    pub function: FunctionId,
    pub line: i32,
    pub column: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct OperandDetails {
    pub size: u64,
    pub is_read: bool,
    pub is_write: bool,
}

/// Static description of one memory instruction's operands.
#[derive(Debug, Clone)]
pub struct AccessDetails {
    pub location: LocationDetails,
    pub operands: Vec<OperandDetails>,
}

/// Outcome of resolving a record's table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved<T> {
    /// The index is not in the table: the stream is corrupt.
    OutOfRange,
    /// The entry was dropped by the filter configuration.
    Filtered,
    Known(T),
}

#[derive(Debug, Default)]
pub struct TraceTables {
    functions: Vec<Option<FunctionId>>,
    locations: Vec<Option<LocationDetails>>,
    access_details: Vec<Option<AccessDetails>>,
    /// First source line per stored function, for conflict-ignore sites.
    function_lines: HashMap<FunctionId, i32>,
}

impl TraceTables {
    #[must_use]
    pub fn function(&self, index: u32) -> Resolved<FunctionId> {
        match self.functions.get(index as usize) {
            None => Resolved::OutOfRange,
            Some(None) => Resolved::Filtered,
            Some(Some(id)) => Resolved::Known(*id),
        }
    }

    #[must_use]
    pub fn location(&self, index: u32) -> Resolved<&LocationDetails> {
        match self.locations.get(index as usize) {
            None => Resolved::OutOfRange,
            Some(None) => Resolved::Filtered,
            Some(Some(details)) => Resolved::Known(details),
        }
    }

    #[must_use]
    pub fn access_details(&self, index: u32) -> Resolved<&AccessDetails> {
        match self.access_details.get(index as usize) {
            None => Resolved::OutOfRange,
            Some(None) => Resolved::Filtered,
            Some(Some(details)) => Resolved::Known(details),
        }
    }

    /// Turn the config's `{function, delta}` pairs into concrete
    /// `(function, line)` sites excluded from conflict detection.
    #[must_use]
    pub fn resolve_conflict_ignores(
        &self,
        ignores: &[ConflictIgnore],
    ) -> HashSet<(FunctionId, i32)> {
        ignores
            .iter()
            .filter_map(|ignore| {
                let line = self.function_lines.get(&ignore.function)?;
                let delta = i32::try_from(ignore.delta).ok()?;
                Some((ignore.function, line + delta))
            })
            .collect()
    }
}

/// Intern the raw tables through the writer, applying the filter the way
/// the front-end would have.
pub fn load_tables(
    raw: &RawTables,
    writer: &SqlWriter,
    filter: &Filter,
) -> Result<TraceTables, TraceError> {
    let mut tables = TraceTables::default();

    let mut images: Vec<Option<ImageId>> = Vec::with_capacity(raw.images.len());
    for name in &raw.images {
        if filter.is_image_filtered(name) {
            debug!("skipping image {name}");
            images.push(None);
            continue;
        }
        let id = writer
            .get_image_id_by_name(name)
            .unwrap_or_else(|| writer.insert_image(name));
        images.push(Some(id));
    }

    let mut files: Vec<Option<FileId>> = Vec::with_capacity(raw.files.len());
    for file in &raw.files {
        let image = *images
            .get(file.image as usize)
            .ok_or(TraceError::IndexOutOfRange { what: "image", index: file.image })?;
        let resolved = match image {
            Some(image) if !filter.is_file_filtered(&file.path) => {
                Some(writer.insert_file(&file.path, image))
            }
            _ => {
                debug!("skipping file {}", file.path);
                None
            }
        };
        files.push(resolved);
    }

    for function in &raw.functions {
        let file = raw
            .files
            .get(function.file as usize)
            .ok_or(TraceError::IndexOutOfRange { what: "file", index: function.file })?;
        let file_id = files[function.file as usize];
        let image_id = images[file.image as usize];

        let dropped = file_id.is_none()
            || filter.is_function_filtered(&function.name)
            || filter.is_function_filtered(&function.prototype);
        if dropped {
            debug!("skipping function {}", function.prototype);
            tables.functions.push(None);
            continue;
        }
        let (Some(file_id), Some(image_id)) = (file_id, image_id) else {
            tables.functions.push(None);
            continue;
        };

        let id = writer
            .get_function_id_by_properties(&function.prototype, image_id, &file.path, function.line)
            .unwrap_or_else(|| {
                writer.insert_function(&Function {
                    id: 0,
                    name: function.name.clone(),
                    prototype: function.prototype.clone(),
                    file: file_id,
                    line: function.line,
                })
            });
        tables.functions.push(Some(id));
        tables.function_lines.insert(id, function.line);
    }

    for location in &raw.locations {
        let function = tables
            .functions
            .get(location.function as usize)
            .copied()
            .ok_or(TraceError::IndexOutOfRange { what: "function", index: location.function })?;
        let resolved = function.map(|function| {
            let id = writer.insert_source_location(&SourceLocation {
                id: 0,
                function,
                line: location.line,
                column: location.column,
            });
            LocationDetails { id, function, line: location.line, column: location.column }
        });
        tables.locations.push(resolved);
    }

    for details in &raw.access_details {
        let location = tables
            .locations
            .get(details.location as usize)
            .copied()
            .ok_or(TraceError::IndexOutOfRange { what: "location", index: details.location })?;
        let resolved = location.map(|location| AccessDetails {
            location,
            operands: details
                .operands
                .iter()
                .map(|&(size, is_read, is_write)| OperandDetails {
                    size: u64::from(size),
                    is_read,
                    is_write,
                })
                .collect(),
        });
        tables.access_details.push(resolved);
    }

    Ok(tables)
}
