//! Typed, multi-dimensional views over a [`SharedMemory`] segment.

use serde::{Deserialize, Serialize};

use crate::error::ShmError;
use crate::shmem::SharedMemory;

/// Element type labels used verbatim on the wire (§6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Complex64,
    Complex128,
    Bool,
}

impl DType {
    /// Element size in bytes (complex types count as two floats).
    pub fn size(self) -> usize {
        match self {
            DType::Int8 | DType::Uint8 | DType::Bool => 1,
            DType::Int16 | DType::Uint16 => 2,
            DType::Int32 | DType::Uint32 | DType::Float32 => 4,
            DType::Int64 | DType::Uint64 | DType::Float64 | DType::Complex64 => 8,
            DType::Complex128 => 16,
        }
    }

    /// The wire label, e.g. `"float32"`.
    pub fn label(self) -> &'static str {
        match self {
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Uint8 => "uint8",
            DType::Uint16 => "uint16",
            DType::Uint32 => "uint32",
            DType::Uint64 => "uint64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Complex64 => "complex64",
            DType::Complex128 => "complex128",
            DType::Bool => "bool",
        }
    }

    pub fn from_label(label: &str) -> Option<DType> {
        Some(match label {
            "int8" => DType::Int8,
            "int16" => DType::Int16,
            "int32" => DType::Int32,
            "int64" => DType::Int64,
            "uint8" => DType::Uint8,
            "uint16" => DType::Uint16,
            "uint32" => DType::Uint32,
            "uint64" => DType::Uint64,
            "float32" => DType::Float32,
            "float64" => DType::Float64,
            "complex64" => DType::Complex64,
            "complex128" => DType::Complex128,
            "bool" => DType::Bool,
            _ => return None,
        })
    }
}

/// Axis ordering. `C` means the last axis varies fastest (the canonical
/// wire order); `F` is the reverse. Converting between them is a pure
/// coordinate transform and never touches the backing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    C,
    F,
}

/// An ordered list of non-negative extents, carried in a named axis order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    extents: Vec<i64>,
    order: Order,
}

impl Shape {
    /// Builds a shape already in C-order (the canonical wire order).
    pub fn c_order(extents: Vec<i64>) -> Shape {
        Shape {
            extents,
            order: Order::C,
        }
    }

    pub fn with_order(extents: Vec<i64>, order: Order) -> Shape {
        Shape { extents, order }
    }

    pub fn extents(&self) -> &[i64] {
        &self.extents
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn ndim(&self) -> usize {
        self.extents.len()
    }

    /// Total element count (product of extents). A reordering never
    /// changes this.
    pub fn product(&self) -> i64 {
        self.extents.iter().product()
    }

    /// Returns this shape's extents reversed into the requested order.
    /// A no-op if already in that order; never touches memory.
    pub fn to_order(&self, order: Order) -> Shape {
        if order == self.order {
            self.clone()
        } else {
            let mut reversed = self.extents.clone();
            reversed.reverse();
            Shape {
                extents: reversed,
                order,
            }
        }
    }

    /// Convenience for `to_order(Order::C)`, used when producing the
    /// canonical wire form.
    pub fn as_c_order(&self) -> Vec<i64> {
        self.to_order(Order::C).extents
    }
}

/// A zero-copy typed view over a [`SharedMemory`] segment, interpreted as
/// a multi-dimensional array in C order.
pub struct NDArray {
    dtype: DType,
    shape: Shape,
    shm: SharedMemory,
}

impl NDArray {
    /// Wraps an existing `SharedMemory` segment as an `NDArray`. Fails if
    /// the segment is too small to hold `product(shape) * dtype.size()`
    /// bytes.
    pub fn new(dtype: DType, shape: Shape, shm: SharedMemory) -> Result<NDArray, ShmError> {
        let needed = shape.product().max(0) as u64 * dtype.size() as u64;
        if shm.rsize() < needed {
            return Err(ShmError::SizeConflict {
                name: shm.name().to_string(),
                requested: needed,
                existing: shm.rsize(),
            });
        }
        Ok(NDArray { dtype, shape, shm })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn shm(&self) -> &SharedMemory {
        &self.shm
    }

    /// Length, in bytes, of the array's data (`product(shape) *
    /// dtype.size()`); may be smaller than the backing segment's size.
    pub fn byte_len(&self) -> usize {
        self.shape.product().max(0) as usize * self.dtype.size()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.shm.as_slice()[..self.byte_len()]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.byte_len();
        &mut self.shm.as_mut_slice()[..len]
    }

    /// Rewraps the same backing memory under a new shape, without
    /// touching any bytes. Fails if the new shape no longer fits.
    pub fn reshape(self, shape: Shape) -> Result<NDArray, ShmError> {
        NDArray::new(self.dtype, shape, self.shm)
    }

    /// Closes the underlying `SharedMemory`.
    pub fn close(mut self) {
        self.shm.close();
    }
}
