//! Element type tags and byte-level views of host arrays.
//!
//! Callers hand this crate host arrays together with byte offsets and byte lengths.
//! The element type tag is used only to pick element counts out of byte counts and
//! to reject byte ranges that would split an element. All transfer plumbing below
//! this module works on raw byte counts, so one parametrized code path serves every
//! element type instead of one near-identical function per type.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;

use crate::error::{Result, TransferError};

/// Element type tag for host-side data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl ElementType {
    /// Size in bytes of one element.
    pub const fn element_size(self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::U64 | ElementType::I64 | ElementType::F64 => 8,
        }
    }

    /// Number of elements in `length` bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidLength` if `length` is not a whole multiple of the
    /// element size. The division is never performed on a partial element.
    pub fn element_count(self, length: usize) -> Result<usize> {
        self.ensure_multiple(length)?;
        Ok(length / self.element_size())
    }

    /// Reject a byte count that would split an element.
    pub fn ensure_multiple(self, bytes: usize) -> Result<()> {
        if bytes % self.element_size() != 0 {
            return Err(TransferError::InvalidLength {
                length: bytes,
                element_size: self.element_size(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::U8 => "u8",
            ElementType::I8 => "i8",
            ElementType::U16 => "u16",
            ElementType::I16 => "i16",
            ElementType::U32 => "u32",
            ElementType::I32 => "i32",
            ElementType::U64 => "u64",
            ElementType::I64 => "i64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        };
        write!(f, "{}", name)
    }
}

/// Plain-old-data element types that may cross the staging boundary.
pub trait HostPod: Copy + Send + Sync + 'static {
    /// The tag describing this element type.
    const ELEMENT: ElementType;
}

impl HostPod for u8 {
    const ELEMENT: ElementType = ElementType::U8;
}
impl HostPod for i8 {
    const ELEMENT: ElementType = ElementType::I8;
}
impl HostPod for u16 {
    const ELEMENT: ElementType = ElementType::U16;
}
impl HostPod for i16 {
    const ELEMENT: ElementType = ElementType::I16;
}
impl HostPod for u32 {
    const ELEMENT: ElementType = ElementType::U32;
}
impl HostPod for i32 {
    const ELEMENT: ElementType = ElementType::I32;
}
impl HostPod for u64 {
    const ELEMENT: ElementType = ElementType::U64;
}
impl HostPod for i64 {
    const ELEMENT: ElementType = ElementType::I64;
}
impl HostPod for f32 {
    const ELEMENT: ElementType = ElementType::F32;
}
impl HostPod for f64 {
    const ELEMENT: ElementType = ElementType::F64;
}

/// Borrowed, read-only byte view of a typed host array.
#[derive(Clone, Copy)]
pub struct HostView<'a> {
    ptr: *const u8,
    byte_len: usize,
    element: ElementType,
    _lifetime: PhantomData<&'a [u8]>,
}

impl<'a> HostView<'a> {
    /// View a typed slice as tagged bytes.
    pub fn new<T: HostPod>(slice: &'a [T]) -> Self {
        HostView {
            ptr: slice.as_ptr() as *const u8,
            byte_len: slice.len() * size_of::<T>(),
            element: T::ELEMENT,
            _lifetime: PhantomData,
        }
    }

    /// Build a view from raw parts, for callers that carry a runtime type tag.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `byte_len` readable bytes that stay valid and
    /// unmodified for the view's lifetime.
    pub unsafe fn from_raw(ptr: *const u8, byte_len: usize, element: ElementType) -> Self {
        HostView {
            ptr,
            byte_len,
            element,
            _lifetime: PhantomData,
        }
    }

    /// The element type tag.
    pub fn element(&self) -> ElementType {
        self.element
    }

    /// Total length of the view in bytes.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Resolve a validated `[offset, offset + length)` byte range to a pointer.
    ///
    /// Both `offset` and `length` must be whole multiples of the element size
    /// and the range must lie within the view.
    pub(crate) fn byte_range(&self, offset: usize, length: usize) -> Result<*const u8> {
        self.element.ensure_multiple(offset)?;
        self.element.ensure_multiple(length)?;
        let end = offset
            .checked_add(length)
            .ok_or(TransferError::RangeOutOfBounds {
                offset,
                length,
                available: self.byte_len,
            })?;
        if end > self.byte_len {
            return Err(TransferError::RangeOutOfBounds {
                offset,
                length,
                available: self.byte_len,
            });
        }
        Ok(unsafe { self.ptr.add(offset) })
    }
}

/// Borrowed, writable byte view of a typed host array.
pub struct HostViewMut<'a> {
    ptr: *mut u8,
    byte_len: usize,
    element: ElementType,
    _lifetime: PhantomData<&'a mut [u8]>,
}

impl<'a> HostViewMut<'a> {
    /// View a typed mutable slice as tagged bytes.
    pub fn new<T: HostPod>(slice: &'a mut [T]) -> Self {
        HostViewMut {
            ptr: slice.as_mut_ptr() as *mut u8,
            byte_len: slice.len() * size_of::<T>(),
            element: T::ELEMENT,
            _lifetime: PhantomData,
        }
    }

    /// Build a mutable view from raw parts, for callers that carry a runtime
    /// type tag.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `byte_len` writable bytes, exclusively referenced
    /// for the view's lifetime.
    pub unsafe fn from_raw(ptr: *mut u8, byte_len: usize, element: ElementType) -> Self {
        HostViewMut {
            ptr,
            byte_len,
            element,
            _lifetime: PhantomData,
        }
    }

    /// The element type tag.
    pub fn element(&self) -> ElementType {
        self.element
    }

    /// Total length of the view in bytes.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Resolve a validated `[offset, offset + length)` byte range to a
    /// writable pointer. Same validation rules as [`HostView::byte_range`].
    pub(crate) fn byte_range_mut(&self, offset: usize, length: usize) -> Result<*mut u8> {
        self.element.ensure_multiple(offset)?;
        self.element.ensure_multiple(length)?;
        let end = offset
            .checked_add(length)
            .ok_or(TransferError::RangeOutOfBounds {
                offset,
                length,
                available: self.byte_len,
            })?;
        if end > self.byte_len {
            return Err(TransferError::RangeOutOfBounds {
                offset,
                length,
                available: self.byte_len,
            });
        }
        Ok(unsafe { self.ptr.add(offset) })
    }
}
