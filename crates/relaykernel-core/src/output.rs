//! Output slots and result demultiplexing.
//!
//! A kernel invocation declares its outputs up front: one slot per output
//! buffer, each with a fixed element type and element count. Slots are a
//! runtime-tagged collection addressed by declaration index, so the
//! read-back walk and the completion path agree on ordering without any
//! side index.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::HostBuffer;
use crate::error::{RelayKernelError, Result};

/// Element type of one output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 32-bit integer.
    U32,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl ScalarType {
    /// Size of one element in bytes.
    pub const fn size_of(self) -> usize {
        match self {
            ScalarType::U8 => 1,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }
}

/// Declaration of one output buffer of a kernel invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    /// Index of the argument buffer this slot reads back from.
    pub arg_index: usize,
    /// Element type of the buffer.
    pub ty: ScalarType,
    /// Number of elements to read back.
    pub len: usize,
}

impl OutputSpec {
    /// Declare an output slot.
    pub fn new(arg_index: usize, ty: ScalarType, len: usize) -> Self {
        Self { arg_index, ty, len }
    }

    /// Byte size of the read-back for this slot.
    pub fn byte_len(&self) -> usize {
        self.ty.size_of() * self.len
    }
}

/// One declared output slot together with its host-side storage.
///
/// Storage starts empty and is sized to the declared byte length when the
/// read-back is submitted.
#[derive(Debug)]
pub struct OutputSlot {
    spec: OutputSpec,
    storage: HostBuffer,
}

impl OutputSlot {
    /// Create a slot with empty storage.
    pub fn new(spec: OutputSpec) -> Self {
        Self {
            spec,
            storage: HostBuffer::new(),
        }
    }

    /// The slot's declaration.
    pub fn spec(&self) -> &OutputSpec {
        &self.spec
    }

    /// The slot's host-side storage.
    pub fn storage(&self) -> &HostBuffer {
        &self.storage
    }

    /// Reinterpret the storage bytes as the declared element type.
    pub fn decode(&self) -> Result<OutputValue> {
        let bytes = self.storage.to_vec();
        if bytes.len() % self.spec.ty.size_of() != 0 {
            return Err(RelayKernelError::command(format!(
                "output storage of {} bytes is not a whole number of {:?} elements",
                bytes.len(),
                self.spec.ty
            )));
        }
        let value = match self.spec.ty {
            ScalarType::U8 => OutputValue::U8(bytes),
            ScalarType::I32 => OutputValue::I32(bytemuck::pod_collect_to_vec(&bytes)),
            ScalarType::U32 => OutputValue::U32(bytemuck::pod_collect_to_vec(&bytes)),
            ScalarType::F32 => OutputValue::F32(bytemuck::pod_collect_to_vec(&bytes)),
            ScalarType::F64 => OutputValue::F64(bytemuck::pod_collect_to_vec(&bytes)),
        };
        Ok(value)
    }
}

/// Typed contents of one output slot after read-back.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    /// Unsigned 8-bit elements.
    U8(Vec<u8>),
    /// Signed 32-bit integer elements.
    I32(Vec<i32>),
    /// Unsigned 32-bit integer elements.
    U32(Vec<u32>),
    /// 32-bit float elements.
    F32(Vec<f32>),
    /// 64-bit float elements.
    F64(Vec<f64>),
}

impl OutputValue {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            OutputValue::U8(v) => v.len(),
            OutputValue::I32(v) => v.len(),
            OutputValue::U32(v) => v.len(),
            OutputValue::F32(v) => v.len(),
            OutputValue::F64(v) => v.len(),
        }
    }

    /// Whether the slot holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The element type tag.
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            OutputValue::U8(_) => ScalarType::U8,
            OutputValue::I32(_) => ScalarType::I32,
            OutputValue::U32(_) => ScalarType::U32,
            OutputValue::F32(_) => ScalarType::F32,
            OutputValue::F64(_) => ScalarType::F64,
        }
    }

    /// View as f32 elements, if that is the slot's type.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            OutputValue::F32(v) => Some(v),
            _ => None,
        }
    }

    /// View as i32 elements, if that is the slot's type.
    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            OutputValue::I32(v) => Some(v),
            _ => None,
        }
    }

    /// Sum of all elements, widened to f64.
    pub fn sum_as_f64(&self) -> f64 {
        match self {
            OutputValue::U8(v) => v.iter().map(|&x| x as f64).sum(),
            OutputValue::I32(v) => v.iter().map(|&x| x as f64).sum(),
            OutputValue::U32(v) => v.iter().map(|&x| x as f64).sum(),
            OutputValue::F32(v) => v.iter().map(|&x| x as f64).sum(),
            OutputValue::F64(v) => v.iter().sum(),
        }
    }
}

/// Reply payload delivered to the requester: one value per output slot, in
/// declaration order.
pub type Reply = Vec<OutputValue>;

/// Optional transform applied to the decoded outputs before delivery.
pub type MapResults = Arc<dyn Fn(Reply) -> Reply + Send + Sync>;
