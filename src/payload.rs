use crate::device::{Buffer, Descriptor, Image, Tensor};
use core::{any::Any, fmt::Debug};
use derive_more::Display;

/// Opaque, node-specific settings or data object.
///
/// Implemented for every `Debug + Send + Sync` type; the engine never looks
/// inside it.
pub trait Param: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Debug + Send + Sync> Param for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Unit of data flowing through an edge.
///
/// The alternatives are mutually exclusive and an edge carries a single kind
/// for its whole lifetime.
#[derive(Debug)]
pub enum Payload {
    Buffer(Buffer),
    Image(Image),
    Tensor(Tensor),
    Param(Box<dyn Param>),
    Opaque(Box<dyn Any + Send + Sync>),
}

/// Discriminant of [`Payload`].
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    #[display("buffer")]
    Buffer,
    #[display("image")]
    Image,
    #[display("tensor")]
    Tensor,
    #[display("param")]
    Param,
    #[display("opaque")]
    Opaque,
}

impl Payload {
    pub fn param(param: impl Param) -> Self {
        Self::Param(Box::new(param))
    }

    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Self::Opaque(Box::new(value))
    }

    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Buffer(_) => PayloadKind::Buffer,
            Self::Image(_) => PayloadKind::Image,
            Self::Tensor(_) => PayloadKind::Tensor,
            Self::Param(_) => PayloadKind::Param,
            Self::Opaque(_) => PayloadKind::Opaque,
        }
    }

    /// Descriptor of device-allocated payloads, `None` for params and opaque
    /// values.
    #[must_use]
    pub fn descriptor(&self) -> Option<Descriptor> {
        match self {
            Self::Buffer(buffer) => Some(Descriptor::Buffer(buffer.desc().clone())),
            Self::Image(image) => Some(Descriptor::Image(image.desc().clone())),
            Self::Tensor(tensor) => Some(Descriptor::Tensor(tensor.desc().clone())),
            Self::Param(_) | Self::Opaque(_) => None,
        }
    }

    #[must_use]
    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            Self::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_image(&self) -> Option<&Image> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    /// Mutable tensor access, available while the producer still owns the
    /// payload (between `create` and `notify_written`).
    pub fn as_tensor_mut(&mut self) -> Option<&mut Tensor> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn as_buffer_mut(&mut self) -> Option<&mut Buffer> {
        match self {
            Self::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn as_image_mut(&mut self) -> Option<&mut Image> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_param<T: Param>(&self) -> Option<&T> {
        match self {
            Self::Param(param) => (**param).as_any().downcast_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_opaque<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Opaque(value) => value.downcast_ref(),
            _ => None,
        }
    }
}

impl From<Buffer> for Payload {
    fn from(buffer: Buffer) -> Self {
        Self::Buffer(buffer)
    }
}

impl From<Image> for Payload {
    fn from(image: Image) -> Self {
        Self::Image(image)
    }
}

impl From<Tensor> for Payload {
    fn from(tensor: Tensor) -> Self {
        Self::Tensor(tensor)
    }
}
