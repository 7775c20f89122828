//! Flat binary encoding of typed values
//!
//! The `encoding` module turns a typed value tree into the byte sequence the native ETW API
//! expects. Every encodable type declares its [`Shape`] through the [`Encode`] trait, so what
//! gets written (and in which order) is decided at compile time:
//! * structures are written field by field, in declaration order (see [`encodable_struct!`])
//! * fixed-size arrays are written element by element, without any length prefix
//! * sequences (slices, `Vec`s) are prefixed with their element count, as a `u64`
//! * scalars are written in the requested [`ByteOrder`]
//!
//! No padding is ever inserted. Structures meant to be copied over native memory must therefore
//! be free of interior padding, which is the case for the ETW headers this crate builds. Trailing
//! padding is another matter: `EVENT_TRACE_PROPERTIES` has 4 bytes of it on 32-bit targets, which
//! the caller zero-fills after encoding.
use std::fmt;

/// Byte order used when writing scalars
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// The byte order of the target this crate is compiled for
    #[cfg(target_endian = "little")]
    pub const NATIVE: ByteOrder = ByteOrder::Little;
    #[cfg(target_endian = "big")]
    pub const NATIVE: ByteOrder = ByteOrder::Big;
}

/// The kind of value an [`Encode`] implementor is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    Array,
    Sequence,
    Structure,
    /// Values that have no flat representation (e.g. raw pointers)
    Opaque,
}

/// Encoding module errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// An absent value was found where a value was expected
    NilValue,
    /// This kind of value cannot be encoded
    UnsupportedShape(&'static str),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::NilValue => write!(f, "cannot encode an absent value"),
            EncodeError::UnsupportedShape(ty) => write!(f, "cannot encode a value of type {}", ty),
        }
    }
}

impl std::error::Error for EncodeError {}

pub type EncodeResult<T> = Result<T, EncodeError>;

/// A type that can be written into an [`Encoder`]
pub trait Encode {
    const SHAPE: Shape;

    fn encode_into(&self, encoder: &mut Encoder) -> EncodeResult<()>;
}

/// Accumulates encoded bytes
#[derive(Debug)]
pub struct Encoder {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl Encoder {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            buf: Vec::new(),
            order,
        }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Appends a value
    pub fn put<T: Encode + ?Sized>(&mut self, value: &T) -> EncodeResult<()> {
        value.encode_into(self)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// Encode a value into a fresh buffer
///
/// `None` stands for an absent reference and fails with [`EncodeError::NilValue`].
pub fn encode<T: Encode + ?Sized>(value: Option<&T>, order: ByteOrder) -> EncodeResult<Vec<u8>> {
    let value = value.ok_or(EncodeError::NilValue)?;
    if T::SHAPE == Shape::Opaque {
        return Err(EncodeError::UnsupportedShape(std::any::type_name::<T>()));
    }

    let mut encoder = Encoder::new(order);
    encoder.put(value)?;
    Ok(encoder.into_bytes())
}

macro_rules! impl_encode_scalar {
    ($($t:ty),+) => {
        $(impl Encode for $t {
            const SHAPE: Shape = Shape::Scalar;

            fn encode_into(&self, encoder: &mut Encoder) -> EncodeResult<()> {
                let bytes = match encoder.order {
                    ByteOrder::Little => self.to_le_bytes(),
                    ByteOrder::Big => self.to_be_bytes(),
                };
                encoder.write(&bytes);
                Ok(())
            }
        })+
    }
}

impl_encode_scalar!(u8, u16, u32, u64, i8, i16, i32, i64, usize, isize, f32, f64);

impl Encode for bool {
    const SHAPE: Shape = Shape::Scalar;

    fn encode_into(&self, encoder: &mut Encoder) -> EncodeResult<()> {
        u8::from(*self).encode_into(encoder)
    }
}

impl<T: Encode, const N: usize> Encode for [T; N] {
    const SHAPE: Shape = Shape::Array;

    fn encode_into(&self, encoder: &mut Encoder) -> EncodeResult<()> {
        for item in self {
            item.encode_into(encoder)?;
        }
        Ok(())
    }
}

impl<T: Encode> Encode for [T] {
    const SHAPE: Shape = Shape::Sequence;

    fn encode_into(&self, encoder: &mut Encoder) -> EncodeResult<()> {
        (self.len() as u64).encode_into(encoder)?;
        for item in self {
            item.encode_into(encoder)?;
        }
        Ok(())
    }
}

impl<T: Encode> Encode for Vec<T> {
    const SHAPE: Shape = Shape::Sequence;

    fn encode_into(&self, encoder: &mut Encoder) -> EncodeResult<()> {
        self.as_slice().encode_into(encoder)
    }
}

impl<T: Encode> Encode for Option<T> {
    const SHAPE: Shape = T::SHAPE;

    fn encode_into(&self, encoder: &mut Encoder) -> EncodeResult<()> {
        match self {
            Some(value) => value.encode_into(encoder),
            None => Err(EncodeError::NilValue),
        }
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    const SHAPE: Shape = T::SHAPE;

    fn encode_into(&self, encoder: &mut Encoder) -> EncodeResult<()> {
        (**self).encode_into(encoder)
    }
}

impl<T: ?Sized> Encode for *const T {
    const SHAPE: Shape = Shape::Opaque;

    fn encode_into(&self, _encoder: &mut Encoder) -> EncodeResult<()> {
        Err(EncodeError::UnsupportedShape("raw pointer"))
    }
}

impl<T: ?Sized> Encode for *mut T {
    const SHAPE: Shape = Shape::Opaque;

    fn encode_into(&self, _encoder: &mut Encoder) -> EncodeResult<()> {
        Err(EncodeError::UnsupportedShape("raw pointer"))
    }
}

/// Declares a struct and its [`Encode`] implementation at once
///
/// Fields are encoded in the order they are declared in, which keeps the encoding in sync with
/// the `#[repr(C)]` layout of the struct.
#[macro_export]
macro_rules! encodable_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_vis:vis $field:ident : $field_ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$field_meta])*
                $field_vis $field: $field_ty,
            )*
        }

        impl $crate::encoding::Encode for $name {
            const SHAPE: $crate::encoding::Shape = $crate::encoding::Shape::Structure;

            fn encode_into(
                &self,
                encoder: &mut $crate::encoding::Encoder,
            ) -> ::std::result::Result<(), $crate::encoding::EncodeError> {
                $( encoder.put(&self.$field)?; )*
                Ok(())
            }
        }
    };
}
