use crate::payload::Payload;
use core::fmt::Debug;
use thiserror::Error;

/// Error reported by a [`Device`] while allocating a payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceError {
    /// The requested allocation exceeds what the device allows.
    #[error("device `{device}` cannot allocate {requested} bytes (limit {limit})")]
    OutOfMemory {
        device: String,
        requested: usize,
        limit: usize,
    },
    /// The descriptor describes an empty or overflowing allocation.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Allocator of payload handles.
///
/// Graphs receive their device explicitly at construction. Handles are
/// released when the last `Arc<Payload>` referring to them is dropped.
pub trait Device: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Allocate a zero-initialized payload matching `desc`.
    fn create_payload(&self, desc: &Descriptor) -> Result<Payload, DeviceError>;

    /// Describe an existing payload.
    fn describe(&self, payload: &Payload) -> Option<Descriptor> {
        payload.descriptor()
    }
}

/// Element type of a tensor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    U8,
    I32,
    F32,
    F64,
}

impl DataType {
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub size: usize,
}

/// Interleaved 8-bit image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    pub data_type: DataType,
    pub shape: Vec<usize>,
}

/// Description of a device allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Descriptor {
    Buffer(BufferDesc),
    Image(ImageDesc),
    Tensor(TensorDesc),
}

impl Descriptor {
    /// Number of bytes the allocation needs, `None` on overflow.
    #[must_use]
    pub fn byte_len(&self) -> Option<usize> {
        match self {
            Self::Buffer(desc) => Some(desc.size),
            Self::Image(desc) => desc
                .width
                .checked_mul(desc.height)?
                .checked_mul(desc.channels),
            Self::Tensor(desc) => desc
                .shape
                .iter()
                .try_fold(desc.data_type.size(), |acc, &dim| acc.checked_mul(dim)),
        }
    }
}

macro_rules! host_allocation {
    ($(#[$meta:meta])* $name:ident, $desc:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            desc: $desc,
            data: Vec<u8>,
        }

        impl $name {
            #[must_use]
            pub fn desc(&self) -> &$desc {
                &self.desc
            }

            #[must_use]
            pub fn as_bytes(&self) -> &[u8] {
                &self.data
            }

            pub fn as_bytes_mut(&mut self) -> &mut [u8] {
                &mut self.data
            }
        }
    };
}

host_allocation!(
    /// Untyped host memory.
    Buffer,
    BufferDesc
);
host_allocation!(
    /// Host image, row-major and interleaved.
    Image,
    ImageDesc
);
host_allocation!(
    /// Host tensor in native byte order.
    Tensor,
    TensorDesc
);

impl Tensor {
    /// The tensor as `f32` elements, `None` for other element types.
    #[must_use]
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        (self.desc.data_type == DataType::F32).then(|| {
            self.data
                .chunks_exact(4)
                .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect()
        })
    }

    /// Overwrite the tensor from `f32` values.
    ///
    /// Returns `false` (and leaves the tensor untouched) on an element type or
    /// length mismatch.
    pub fn fill_f32(&mut self, values: &[f32]) -> bool {
        if self.desc.data_type != DataType::F32 || values.len() * 4 != self.data.len() {
            return false;
        }
        for (chunk, value) in self.data.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
        true
    }
}

/// Device allocating zeroed payloads in host memory.
#[derive(Debug, Clone)]
pub struct HostDevice {
    name: String,
    max_allocation: usize,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self {
            name: "host".to_owned(),
            max_allocation: 1 << 30,
        }
    }
}

impl HostDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap a single allocation at `max_allocation` bytes.
    #[must_use]
    pub fn with_max_allocation(mut self, max_allocation: usize) -> Self {
        self.max_allocation = max_allocation;
        self
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_payload(&self, desc: &Descriptor) -> Result<Payload, DeviceError> {
        let Some(len) = desc.byte_len() else {
            return Err(DeviceError::InvalidDescriptor(format!(
                "{desc:?} overflows usize"
            )));
        };
        if len > self.max_allocation {
            return Err(DeviceError::OutOfMemory {
                device: self.name.clone(),
                requested: len,
                limit: self.max_allocation,
            });
        }
        let data = vec![0; len];
        Ok(match desc {
            Descriptor::Buffer(desc) => Payload::Buffer(Buffer {
                desc: desc.clone(),
                data,
            }),
            Descriptor::Image(desc) => Payload::Image(Image {
                desc: desc.clone(),
                data,
            }),
            Descriptor::Tensor(desc) => Payload::Tensor(Tensor {
                desc: desc.clone(),
                data,
            }),
        })
    }
}
