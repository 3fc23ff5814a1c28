//! Tensor Marshalling
//!
//! Host tensors are owned `ndarray` arrays. Inputs are handed to the engine
//! as a borrowed buffer pointer plus `i64` dims and an ONNX element-type tag.
//! Outputs come back as views over engine memory; they borrow the predictor
//! and never own the buffer.

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};
use std::os::raw::{c_int, c_void};
use std::ptr::NonNull;

use crate::bridge;
use crate::error::{PredictorError, Result};
use crate::ffi::{self, OrtValue, PredictorHandle};

/// ONNX tensor element type tags used by the native ABI
pub mod native_tag {
    pub const UNDEFINED: i32 = 0;
    pub const FLOAT: i32 = 1;
    pub const UINT8: i32 = 2;
    pub const INT8: i32 = 3;
    pub const UINT16: i32 = 4;
    pub const INT16: i32 = 5;
    pub const INT32: i32 = 6;
    pub const INT64: i32 = 7;
    pub const STRING: i32 = 8;
    pub const BOOL: i32 = 9;
    pub const FLOAT16: i32 = 10;
    pub const DOUBLE: i32 = 11;
    pub const UINT32: i32 = 12;
    pub const UINT64: i32 = 13;
}

/// Element kinds that can cross the native boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Float32,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Bool,
}

impl ElementType {
    /// Native type tag for this element kind
    pub fn to_native(self) -> i32 {
        match self {
            ElementType::Float32 => native_tag::FLOAT,
            ElementType::Float64 => native_tag::DOUBLE,
            ElementType::Int8 => native_tag::INT8,
            ElementType::Int16 => native_tag::INT16,
            ElementType::Int32 => native_tag::INT32,
            ElementType::Int64 => native_tag::INT64,
            ElementType::Uint8 => native_tag::UINT8,
            ElementType::Uint16 => native_tag::UINT16,
            ElementType::Uint32 => native_tag::UINT32,
            ElementType::Uint64 => native_tag::UINT64,
            ElementType::Bool => native_tag::BOOL,
        }
    }

    /// Element kind for a native type tag, `None` if the host has no counterpart
    pub fn from_native(tag: i32) -> Option<Self> {
        match tag {
            native_tag::FLOAT => Some(ElementType::Float32),
            native_tag::DOUBLE => Some(ElementType::Float64),
            native_tag::INT8 => Some(ElementType::Int8),
            native_tag::INT16 => Some(ElementType::Int16),
            native_tag::INT32 => Some(ElementType::Int32),
            native_tag::INT64 => Some(ElementType::Int64),
            native_tag::UINT8 => Some(ElementType::Uint8),
            native_tag::UINT16 => Some(ElementType::Uint16),
            native_tag::UINT32 => Some(ElementType::Uint32),
            native_tag::UINT64 => Some(ElementType::Uint64),
            native_tag::BOOL => Some(ElementType::Bool),
            _ => None,
        }
    }

    /// Size of one element in bytes
    pub fn size_of(self) -> usize {
        match self {
            ElementType::Int8 | ElementType::Uint8 | ElementType::Bool => 1,
            ElementType::Int16 | ElementType::Uint16 => 2,
            ElementType::Float32 | ElementType::Int32 | ElementType::Uint32 => 4,
            ElementType::Float64 | ElementType::Int64 | ElementType::Uint64 => 8,
        }
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
            ElementType::Int8 => "int8",
            ElementType::Int16 => "int16",
            ElementType::Int32 => "int32",
            ElementType::Int64 => "int64",
            ElementType::Uint8 => "uint8",
            ElementType::Uint16 => "uint16",
            ElementType::Uint32 => "uint32",
            ElementType::Uint64 => "uint64",
            ElementType::Bool => "bool",
        }
    }
}

macro_rules! tensor_kinds {
    ($($variant:ident($ty:ty) => $accessor:ident;)*) => {
        /// Dense host tensor passed to [`crate::Predictor::predict`]
        #[derive(Debug, Clone, PartialEq)]
        pub enum Tensor {
            $($variant(ArrayD<$ty>),)*
        }

        /// Output tensor viewing engine memory, valid while the predictor is borrowed
        #[derive(Debug, Clone, PartialEq)]
        pub enum TensorView<'a> {
            $($variant(ArrayViewD<'a, $ty>),)*
        }

        impl Tensor {
            /// Element kind of this tensor
            pub fn element_type(&self) -> ElementType {
                match self {
                    $(Tensor::$variant(_) => ElementType::$variant,)*
                }
            }

            /// Shape of this tensor
            pub fn shape(&self) -> &[usize] {
                match self {
                    $(Tensor::$variant(array) => array.shape(),)*
                }
            }

            /// Whether elements are contiguous in row-major order
            pub fn is_dense(&self) -> bool {
                match self {
                    $(Tensor::$variant(array) => array.is_standard_layout(),)*
                }
            }

            fn as_raw_ptr(&self) -> *const c_void {
                match self {
                    $(Tensor::$variant(array) => array.as_ptr() as *const c_void,)*
                }
            }

            $(
                #[doc = concat!("Borrow as `", stringify!($ty), "` array")]
                pub fn $accessor(&self) -> Option<&ArrayD<$ty>> {
                    match self {
                        Tensor::$variant(array) => Some(array),
                        _ => None,
                    }
                }
            )*
        }

        $(
            impl From<ArrayD<$ty>> for Tensor {
                fn from(array: ArrayD<$ty>) -> Self {
                    Tensor::$variant(array)
                }
            }
        )*

        impl<'a> TensorView<'a> {
            /// Element kind of this view
            pub fn element_type(&self) -> ElementType {
                match self {
                    $(TensorView::$variant(_) => ElementType::$variant,)*
                }
            }

            /// Shape of this view
            pub fn shape(&self) -> &[usize] {
                match self {
                    $(TensorView::$variant(view) => view.shape(),)*
                }
            }

            /// Copy the data out so it can outlive the session
            pub fn to_tensor(&self) -> Tensor {
                match self {
                    $(TensorView::$variant(view) => Tensor::$variant(view.to_owned()),)*
                }
            }

            $(
                #[doc = concat!("Borrow as `", stringify!($ty), "` view")]
                pub fn $accessor(&self) -> Option<&ArrayViewD<'a, $ty>> {
                    match self {
                        TensorView::$variant(view) => Some(view),
                        _ => None,
                    }
                }
            )*
        }

        /// Build a typed view over engine memory
        ///
        /// # Safety
        /// `data` must point to `len` initialized elements of `element`,
        /// aligned, and stay valid for `'a`.
        unsafe fn view_typed<'a>(
            element: ElementType,
            data: *const c_void,
            shape: IxDyn,
            len: usize,
        ) -> TensorView<'a> {
            match element {
                $(ElementType::$variant => {
                    let ptr = if len == 0 {
                        NonNull::<$ty>::dangling().as_ptr() as *const $ty
                    } else {
                        data as *const $ty
                    };
                    TensorView::$variant(ArrayViewD::from_shape_ptr(shape, ptr))
                })*
            }
        }
    };
}

tensor_kinds! {
    Float32(f32) => as_f32;
    Float64(f64) => as_f64;
    Int8(i8) => as_i8;
    Int16(i16) => as_i16;
    Int32(i32) => as_i32;
    Int64(i64) => as_i64;
    Uint8(u8) => as_u8;
    Uint16(u16) => as_u16;
    Uint32(u32) => as_u32;
    Uint64(u64) => as_u64;
    Bool(bool) => as_bool;
}

impl Tensor {
    /// Number of elements
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// Check if the tensor holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape as the `i64` dims the engine expects
    pub fn native_dims(&self) -> Vec<i64> {
        self.shape().iter().map(|&d| d as i64).collect()
    }
}

impl TensorView<'_> {
    /// Number of elements
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// Check if the view holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hand one dense input to the engine's add-input operation
///
/// The engine keeps the buffer pointer until the next clear, so `tensor`
/// must stay borrowed until the run that reads it has returned.
pub(crate) fn bind_input(handle: PredictorHandle, tensor: &Tensor) -> Result<()> {
    if !tensor.is_dense() {
        return Err(PredictorError::UnsupportedTensorKind(format!(
            "expecting a dense tensor, got a strided {} tensor with shape {:?}",
            tensor.element_type().as_str(),
            tensor.shape()
        )));
    }

    let dims = tensor.native_dims();
    let rank = c_int::try_from(dims.len()).map_err(|_| {
        PredictorError::UnsupportedTensorKind(format!("rank {} is too large", dims.len()))
    })?;
    let dtype = tensor.element_type().to_native();

    // The engine only reads input buffers; the ABI takes them as `void*`
    bridge::invoke("add_input", || unsafe {
        ffi::ort_add_input(
            handle,
            tensor.as_raw_ptr() as *mut c_void,
            dims.as_ptr(),
            rank,
            dtype,
        )
    })
}

/// Wrap a native output as a host view without copying
///
/// # Safety
/// The buffers behind `value` must stay valid and unmodified for `'a`.
pub(crate) unsafe fn view_native_output<'a>(value: &OrtValue) -> Result<TensorView<'a>> {
    let element = ElementType::from_native(value.otype).ok_or_else(|| {
        PredictorError::UnsupportedTensorKind(format!(
            "native output element type {} has no host counterpart",
            value.otype
        ))
    })?;

    let dims: &[i64] = if value.shape_len == 0 {
        &[]
    } else if value.shape_ptr.is_null() {
        return Err(PredictorError::UnsupportedTensorKind(
            "native output has a null shape".to_string(),
        ));
    } else {
        std::slice::from_raw_parts(value.shape_ptr, value.shape_len)
    };

    let shape = dims
        .iter()
        .map(|&d| {
            usize::try_from(d).map_err(|_| {
                PredictorError::UnsupportedTensorKind(format!(
                    "native output has negative dimension {}",
                    d
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let len: usize = shape.iter().product();
    if len > 0 && value.data_ptr.is_null() {
        return Err(PredictorError::UnsupportedTensorKind(
            "native output has a null buffer".to_string(),
        ));
    }

    Ok(view_typed(element, value.data_ptr, IxDyn(&shape), len))
}
