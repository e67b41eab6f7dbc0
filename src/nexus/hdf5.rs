//! HDF5 backend (feature `storage_hdf5`).
//!
//! Every declared field gets its dataset when the layout is materialized, so
//! fields that never receive data still appear with their attributes. Fields
//! bound to STEP are chunked datasets of shape `[n_steps, *declared]` whose
//! leading axis grows by one per append. Write-once fields use a fixed shape.
//! Strings are variable-length UTF-8.

use super::backend::FileBackend;
use super::{FieldSpec, NexusFile, NexusPath};
use crate::data::{DataFormat, DataHolder, ElementType};
use crate::error::{WriterError, WriterResult};
use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, Extent, Extents, H5Type, Hyperslab, Location, SliceOrIndex};
use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const CHUNK: usize = 1024;

/// Backend creating HDF5 files.
pub struct Hdf5Backend;

impl FileBackend for Hdf5Backend {
    fn name(&self) -> &str {
        "hdf5"
    }

    fn create(&self, path: &Path, overwrite: bool) -> WriterResult<Box<dyn NexusFile>> {
        let file = if overwrite {
            hdf5::File::create(path)
        } else {
            hdf5::File::create_excl(path)
        }
        .map_err(|e| h5_err(&path.display().to_string(), e))?;
        debug!(path = %path.display(), "hdf5 file created");
        Ok(Box::new(Hdf5NexusFile {
            path: path.to_path_buf(),
            file: Some(file),
            fields: HashMap::new(),
        }))
    }
}

struct FieldState {
    spec: FieldSpec,
    // Per-step shape of a growing field, or the full shape of a write-once one.
    shape: Vec<usize>,
    // Undeclared shapes are replaced by the first value written.
    provisional: bool,
    steps: usize,
    // Replayed whenever the dataset is recreated.
    attributes: Vec<(String, DataHolder)>,
}

/// HDF5 implementation of [`NexusFile`].
pub struct Hdf5NexusFile {
    path: PathBuf,
    file: Option<hdf5::File>,
    fields: HashMap<NexusPath, FieldState>,
}

impl Hdf5NexusFile {
    fn file(&self) -> WriterResult<&hdf5::File> {
        self.file.as_ref().ok_or_else(|| {
            WriterError::Storage(format!("file '{}' is closed", self.path.display()))
        })
    }

    fn parent_group(&self, path: &NexusPath) -> WriterResult<hdf5::Group> {
        let parent = path.parent().unwrap_or_default().to_string();
        self.file()?.group(&parent).map_err(|e| h5_err(&parent, e))
    }

    fn state(&self, path: &NexusPath) -> WriterResult<&FieldState> {
        self.fields
            .get(path)
            .ok_or_else(|| WriterError::Storage(format!("no field at '{path}'")))
    }

    /// Drop any dataset at `path` and create it empty with `shape`, growing
    /// along a leading unlimited axis when the field is bound to STEP.
    fn create_dataset(&self, path: &NexusPath, shape: &[usize]) -> WriterResult<Dataset> {
        let name = path.to_string();
        let state = self.state(path)?;
        let parent = self.parent_group(path)?;
        let leaf = path.name().unwrap_or_default();
        if parent.link_exists(leaf) {
            parent.unlink(leaf).map_err(|e| h5_err(&name, e))?;
        }
        let layout = Layout::new(state.spec.growing, shape);
        let dataset = match state.spec.element_type {
            ElementType::Bool => layout.create::<bool>(&parent, leaf),
            ElementType::Int64 => layout.create::<i64>(&parent, leaf),
            ElementType::UInt64 => layout.create::<u64>(&parent, leaf),
            ElementType::Float64 => layout.create::<f64>(&parent, leaf),
            ElementType::Text => layout.create::<VarLenUnicode>(&parent, leaf),
        }
        .map_err(|e| h5_err(&name, e))?;
        for (attr, value) in &state.attributes {
            write_any_attr(&dataset, &name, attr, value)?;
        }
        Ok(dataset)
    }

    fn dataset(&self, path: &NexusPath) -> WriterResult<Dataset> {
        let name = path.to_string();
        self.file()?.dataset(&name).map_err(|e| h5_err(&name, e))
    }

    /// Check `value` against the field's shape. Returns true when the dataset
    /// must be recreated because the field adopted the value's shape.
    fn settle_shape(&mut self, path: &NexusPath, value: &DataHolder) -> WriterResult<bool> {
        let name = path.to_string();
        let state = self
            .fields
            .get_mut(path)
            .ok_or_else(|| WriterError::Storage(format!("no field at '{name}'")))?;
        let count: usize = state.shape.iter().product();
        if state.shape.as_slice() == value.shape() || (!state.provisional && count == value.len()) {
            return Ok(false);
        }
        if !state.spec.growing || (state.provisional && state.steps == 0) {
            state.shape = value.shape().to_vec();
            state.provisional = false;
            return Ok(true);
        }
        Err(WriterError::ShapeMismatch {
            path: name,
            declared: state.shape.clone(),
            actual: value.shape().to_vec(),
        })
    }
}

impl NexusFile for Hdf5NexusFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn create_group(&mut self, path: &NexusPath, nx_class: &str) -> WriterResult<()> {
        if path.is_root() {
            return Ok(());
        }
        let name = path.to_string();
        if self.file()?.group(&name).is_ok() {
            return Ok(());
        }
        let parent = self.parent_group(path)?;
        let leaf = path.name().unwrap_or_default();
        let group = parent.create_group(leaf).map_err(|e| h5_err(&name, e))?;
        write_text_attr(&group, "NX_class", nx_class).map_err(|e| h5_err(&name, e))
    }

    fn create_field(&mut self, path: &NexusPath, spec: &FieldSpec) -> WriterResult<()> {
        if self.fields.contains_key(path) {
            return Ok(());
        }
        let shape = spec.shape.clone().unwrap_or_default();
        self.fields.insert(
            path.clone(),
            FieldState {
                spec: spec.clone(),
                shape: shape.clone(),
                provisional: spec.shape.is_none(),
                steps: 0,
                attributes: Vec::new(),
            },
        );
        self.create_dataset(path, &shape)?;
        Ok(())
    }

    fn write_field(&mut self, path: &NexusPath, value: &DataHolder) -> WriterResult<()> {
        let name = path.to_string();
        let value = cast(value, self.state(path)?.spec.element_type, &name)?;
        let dataset = if self.settle_shape(path, &value)? {
            self.create_dataset(path, value.shape())?
        } else {
            self.dataset(path)?
        };
        let result = match value.element_type() {
            ElementType::Bool => write_whole(&dataset, &value, value.to_bool_array_any()?),
            ElementType::Int64 => write_whole(&dataset, &value, value.to_i64_array_any()?),
            ElementType::UInt64 => write_whole(&dataset, &value, value.to_u64_array_any()?),
            ElementType::Float64 => write_whole(&dataset, &value, value.to_f64_array_any()?),
            ElementType::Text => write_whole(&dataset, &value, to_unicode(&value)?),
        };
        result.map_err(|e| h5_err(&name, e))
    }

    fn append_field(&mut self, path: &NexusPath, value: &DataHolder) -> WriterResult<()> {
        let name = path.to_string();
        let value = cast(value, self.state(path)?.spec.element_type, &name)?;
        let dataset = if self.settle_shape(path, &value)? {
            let shape = value.shape().to_vec();
            self.create_dataset(path, &shape)?
        } else {
            self.dataset(path)?
        };
        let state = self.state(path)?;
        let step = state.steps;
        let step_shape = state.shape.clone();
        let shape = step_shape.as_slice();
        let result = match value.element_type() {
            ElementType::Bool => append_step(&dataset, step, shape, value.to_bool_array_any()?),
            ElementType::Int64 => append_step(&dataset, step, shape, value.to_i64_array_any()?),
            ElementType::UInt64 => append_step(&dataset, step, shape, value.to_u64_array_any()?),
            ElementType::Float64 => append_step(&dataset, step, shape, value.to_f64_array_any()?),
            ElementType::Text => append_step(&dataset, step, shape, to_unicode(&value)?),
        };
        result.map_err(|e| h5_err(&name, e))?;
        if let Some(state) = self.fields.get_mut(path) {
            state.steps += 1;
        }
        Ok(())
    }

    fn write_attribute(
        &mut self,
        owner: &NexusPath,
        name: &str,
        value: &DataHolder,
    ) -> WriterResult<()> {
        let owner_name = owner.to_string();
        if let Some(state) = self.fields.get_mut(owner) {
            state.attributes.retain(|(existing, _)| existing != name);
            state.attributes.push((name.to_string(), value.clone()));
            let dataset = self.dataset(owner)?;
            return write_any_attr(&dataset, &owner_name, name, value);
        }
        let group = self
            .file()?
            .group(&owner_name)
            .map_err(|e| h5_err(&owner_name, e))?;
        write_any_attr(&group, &owner_name, name, value)
    }

    fn create_link(&mut self, path: &NexusPath, target: &NexusPath) -> WriterResult<()> {
        let name = path.to_string();
        let parent = self.parent_group(path)?;
        parent
            .link_soft(&target.to_string(), path.name().unwrap_or_default())
            .map_err(|e| h5_err(&name, e))
    }

    fn flush(&mut self) -> WriterResult<()> {
        let path = self.path.display().to_string();
        self.file()?.flush().map_err(|e| h5_err(&path, e))
    }

    fn close(&mut self) -> WriterResult<()> {
        self.flush()?;
        if let Some(file) = self.file.take() {
            let path = self.path.display().to_string();
            file.close().map_err(|e| h5_err(&path, e))?;
        }
        Ok(())
    }
}

/// Dataspace and chunking of a field dataset.
struct Layout {
    extents: Extents,
    chunk: Option<Vec<usize>>,
}

impl Layout {
    fn new(growing: bool, shape: &[usize]) -> Self {
        if growing {
            let mut extents = vec![Extent::resizable(0)];
            extents.extend(shape.iter().map(|&d| Extent::fixed(d)));
            // Scalar steps share chunks; array steps get one chunk each.
            let steps_per_chunk = if shape.is_empty() { CHUNK } else { 1 };
            let mut chunk = vec![steps_per_chunk];
            chunk.extend(shape.iter().map(|&d| d.max(1)));
            Self {
                extents: Extents::from(extents),
                chunk: Some(chunk),
            }
        } else if shape.is_empty() {
            Self {
                extents: Extents::Scalar,
                chunk: None,
            }
        } else {
            Self {
                extents: Extents::from(shape.to_vec()),
                chunk: None,
            }
        }
    }

    fn create<T: H5Type>(&self, parent: &hdf5::Group, name: &str) -> hdf5::Result<Dataset> {
        let builder = parent.new_dataset::<T>();
        match &self.chunk {
            Some(chunk) => builder
                .shape(self.extents.clone())
                .chunk(chunk.clone())
                .create(name),
            None => builder.shape(self.extents.clone()).create(name),
        }
    }
}

fn write_whole<T: H5Type>(
    dataset: &Dataset,
    holder: &DataHolder,
    data: Vec<T>,
) -> hdf5::Result<()> {
    if holder.format() == DataFormat::Scalar && dataset.ndim() == 0 {
        return match data.first() {
            Some(value) => dataset.write_scalar(value),
            None => Ok(()),
        };
    }
    dataset.write_raw(&data)
}

/// Grow the leading axis to `step + 1` and write `data` into slab `[step, ..]`.
fn append_step<T: H5Type>(
    dataset: &Dataset,
    step: usize,
    step_shape: &[usize],
    data: Vec<T>,
) -> hdf5::Result<()> {
    let mut extent = vec![step + 1];
    extent.extend_from_slice(step_shape);
    dataset.resize(extent)?;

    let mut slab_shape = vec![1];
    slab_shape.extend_from_slice(step_shape);
    let slab = ArrayD::from_shape_vec(IxDyn(&slab_shape), data)
        .map_err(|e| hdf5::Error::from(e.to_string()))?;
    let mut ranges: Vec<SliceOrIndex> = vec![(step..step + 1).into()];
    ranges.extend(step_shape.iter().map(|&d| SliceOrIndex::from(0..d)));
    dataset.write_slice(slab.view(), Hyperslab::from(ranges))
}

/// Flattened typed views that, unlike the public array views, also accept scalars.
trait FlatValues {
    fn to_f64_array_any(&self) -> WriterResult<Vec<f64>>;
    fn to_i64_array_any(&self) -> WriterResult<Vec<i64>>;
    fn to_u64_array_any(&self) -> WriterResult<Vec<u64>>;
    fn to_bool_array_any(&self) -> WriterResult<Vec<bool>>;
}

impl FlatValues for DataHolder {
    fn to_f64_array_any(&self) -> WriterResult<Vec<f64>> {
        flat(self, |h| h.to_f64_array())
    }
    fn to_i64_array_any(&self) -> WriterResult<Vec<i64>> {
        flat(self, |h| h.to_i64_array())
    }
    fn to_u64_array_any(&self) -> WriterResult<Vec<u64>> {
        flat(self, |h| h.to_u64_array())
    }
    fn to_bool_array_any(&self) -> WriterResult<Vec<bool>> {
        flat(self, |h| h.to_bool_array())
    }
}

fn flat<T>(
    holder: &DataHolder,
    view: impl Fn(&DataHolder) -> Result<Vec<T>, crate::data::ConversionError>,
) -> WriterResult<Vec<T>> {
    let as_array;
    let source = if holder.format() == DataFormat::Scalar {
        as_array = DataHolder::spectrum(holder.values().to_vec())
            .map_err(|e| WriterError::Storage(e.to_string()))?;
        &as_array
    } else {
        holder
    };
    view(source).map_err(|e| WriterError::Storage(e.to_string()))
}

fn to_unicode(holder: &DataHolder) -> WriterResult<Vec<VarLenUnicode>> {
    holder
        .values()
        .iter()
        .map(|v| {
            v.to_string()
                .parse::<VarLenUnicode>()
                .map_err(|e| WriterError::Storage(format!("invalid string '{v}': {e}")))
        })
        .collect()
}

fn cast(value: &DataHolder, target: ElementType, path: &str) -> WriterResult<DataHolder> {
    value
        .clone()
        .cast(target)
        .map_err(|e| WriterError::Storage(format!("cannot store value at '{path}': {e}")))
}

fn write_any_attr(
    location: &Location,
    owner: &str,
    name: &str,
    value: &DataHolder,
) -> WriterResult<()> {
    let result = match value.as_scalar() {
        Some(scalar) => match value.element_type() {
            ElementType::Float64 => {
                write_scalar_attr(location, name, &scalar.as_f64().unwrap_or_default())
            }
            ElementType::Int64 => {
                write_scalar_attr(location, name, &scalar.as_i64().unwrap_or_default())
            }
            ElementType::UInt64 => {
                write_scalar_attr(location, name, &scalar.as_u64().unwrap_or_default())
            }
            ElementType::Bool => {
                write_scalar_attr(location, name, &scalar.as_bool().unwrap_or_default())
            }
            ElementType::Text => write_text_attr(location, name, &scalar.to_string()),
        },
        None => match value.element_type() {
            ElementType::Float64 => write_array_attr(location, name, &value.to_f64_array_any()?),
            ElementType::Int64 => write_array_attr(location, name, &value.to_i64_array_any()?),
            ElementType::UInt64 => write_array_attr(location, name, &value.to_u64_array_any()?),
            ElementType::Bool => write_array_attr(location, name, &value.to_bool_array_any()?),
            ElementType::Text => write_array_attr(location, name, &to_unicode(value)?),
        },
    };
    result.map_err(|e| h5_err(owner, e))
}

fn write_text_attr(location: &Location, name: &str, value: &str) -> hdf5::Result<()> {
    let value = value
        .parse::<VarLenUnicode>()
        .map_err(|e| hdf5::Error::from(e.to_string()))?;
    write_scalar_attr(location, name, &value)
}

fn write_scalar_attr<T: H5Type>(location: &Location, name: &str, value: &T) -> hdf5::Result<()> {
    // Rewrites (e.g. a second start_time) reuse the existing attribute.
    match location.attr(name) {
        Ok(existing) => existing.write_scalar(value),
        Err(_) => location.new_attr::<T>().create(name)?.write_scalar(value),
    }
}

fn write_array_attr<T: H5Type>(location: &Location, name: &str, values: &[T]) -> hdf5::Result<()> {
    // Same-length rewrites reuse the attribute; anything else replaces it.
    if let Ok(existing) = location.attr(name) {
        if existing.shape() == [values.len()] {
            return existing.write_raw(values);
        }
        location.delete_attr(name)?;
    }
    location
        .new_attr::<T>()
        .shape(values.len())
        .create(name)?
        .write_raw(values)
}

fn h5_err(path: &str, error: impl std::fmt::Display) -> WriterError {
    WriterError::Storage(format!("hdf5 error at '{path}': {error}"))
}
