//! Shared, growable storage buffers.
//!
//! A `Storage` is the physical allocation behind parameter values, per-clone
//! tensor instances, and buffer slots. Many tensor instances may hold the
//! same `Storage` after the aliasing applier commits an assignment; each
//! instance views the prefix matching its own shape. Identity is `Arc`
//! pointer identity, which is what the parameter-pinning tests compare.

use std::sync::{Arc, Mutex};

use anyhow::{ensure, Result};

/// Reference-counted f32 buffer with interior mutability.
#[derive(Debug, Clone)]
pub struct Storage {
    cells: Arc<Mutex<Vec<f32>>>,
}

impl Storage {
    /// Allocates a zero-filled buffer of `len` elements.
    pub fn zeros(len: usize) -> Self {
        Storage {
            cells: Arc::new(Mutex::new(vec![0.0; len])),
        }
    }

    /// Wraps an owned vector as storage.
    pub fn from_vec(data: Vec<f32>) -> Self {
        Storage {
            cells: Arc::new(Mutex::new(data)),
        }
    }

    /// Current capacity in elements.
    pub fn len(&self) -> usize {
        self.cells.lock().expect("storage poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows the buffer to at least `len` elements, zero-filling new space.
    /// Never shrinks: a slot sized for a wider batch stays usable for a
    /// narrower one.
    pub fn ensure_len(&self, len: usize) {
        let mut cells = self.cells.lock().expect("storage poisoned");
        if cells.len() < len {
            cells.resize(len, 0.0);
        }
    }

    /// Copies out the first `len` elements.
    pub fn read(&self, len: usize) -> Result<Vec<f32>> {
        let cells = self.cells.lock().expect("storage poisoned");
        ensure!(
            cells.len() >= len,
            "storage read of {} elements exceeds capacity {}",
            len,
            cells.len()
        );
        Ok(cells[..len].to_vec())
    }

    /// Overwrites the prefix with `data`, growing the buffer when necessary.
    pub fn write(&self, data: &[f32]) {
        let mut cells = self.cells.lock().expect("storage poisoned");
        if cells.len() < data.len() {
            cells.resize(data.len(), 0.0);
        }
        cells[..data.len()].copy_from_slice(data);
    }

    /// Sets the first `len` elements to `value`.
    pub fn fill_prefix(&self, len: usize, value: f32) {
        let mut cells = self.cells.lock().expect("storage poisoned");
        if cells.len() < len {
            cells.resize(len, 0.0);
        }
        for cell in &mut cells[..len] {
            *cell = value;
        }
    }

    /// Element-wise accumulation of `data` into the prefix.
    pub fn accumulate(&self, data: &[f32]) -> Result<()> {
        let mut cells = self.cells.lock().expect("storage poisoned");
        ensure!(
            cells.len() >= data.len(),
            "storage accumulate of {} elements exceeds capacity {}",
            data.len(),
            cells.len()
        );
        for (cell, value) in cells.iter_mut().zip(data.iter()) {
            *cell += *value;
        }
        Ok(())
    }

    /// Stable identity of the underlying allocation.
    pub fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.cells) as usize
    }

    /// Reports whether two handles share one allocation.
    pub fn same_allocation(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.cells, &other.cells)
    }
}
