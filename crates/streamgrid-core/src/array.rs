//! Host array descriptors.
//!
//! An [`ArrayDescriptor`] borrows caller-owned host memory for the duration
//! of one execution. Inputs are borrowed shared, in/out arrays exclusively,
//! so the borrow checker rules out aliasing between them.

use std::fmt;

use crate::device::HostSlice;
use crate::error::{ExecutionError, Result};

/// How the kernel accesses an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessRole {
    /// Read only.
    Input,
    /// Read, and written back to the host only when the call succeeds.
    InOut,
}

impl fmt::Display for AccessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessRole::Input => write!(f, "input"),
            AccessRole::InOut => write!(f, "in/out"),
        }
    }
}

#[derive(Debug)]
enum HostData<'a> {
    Input(&'a [f64]),
    InOut(&'a mut [f64]),
}

/// A flat host array taking part in one execution.
///
/// Logical element `i` lives at host index `i * stride`.
#[derive(Debug)]
pub struct ArrayDescriptor<'a> {
    data: HostData<'a>,
    len: usize,
    stride: usize,
}

impl<'a> ArrayDescriptor<'a> {
    /// Contiguous read-only array.
    pub fn input(data: &'a [f64]) -> Self {
        Self {
            len: data.len(),
            data: HostData::Input(data),
            stride: 1,
        }
    }

    /// Contiguous read/write array.
    ///
    /// Results go through an engine-owned copy and reach `data` only when
    /// the execution succeeds; on error or cancellation `data` is unchanged.
    pub fn in_out(data: &'a mut [f64]) -> Self {
        Self {
            len: data.len(),
            data: HostData::InOut(data),
            stride: 1,
        }
    }

    /// Strided read-only array of `len` logical elements.
    pub fn input_strided(data: &'a [f64], len: usize, stride: usize) -> Result<Self> {
        check_stride(data.len(), len, stride)?;
        Ok(Self {
            data: HostData::Input(data),
            len,
            stride,
        })
    }

    /// Strided read/write array of `len` logical elements.
    pub fn in_out_strided(data: &'a mut [f64], len: usize, stride: usize) -> Result<Self> {
        check_stride(data.len(), len, stride)?;
        Ok(Self {
            data: HostData::InOut(data),
            len,
            stride,
        })
    }

    /// Access role.
    pub fn role(&self) -> AccessRole {
        match self.data {
            HostData::Input(_) => AccessRole::Input,
            HostData::InOut(_) => AccessRole::InOut,
        }
    }

    /// Number of logical elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array has no logical elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Element stride on the host.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Whether logical elements are adjacent on the host.
    pub fn is_contiguous(&self) -> bool {
        self.stride == 1
    }

    /// Size of the logical data in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<f64>()
    }

    /// Logical element `i`.
    pub fn get(&self, i: usize) -> Option<f64> {
        if i >= self.len {
            return None;
        }
        self.host().get(i * self.stride).copied()
    }

    /// Pack the logical elements into a contiguous vector.
    pub fn gather(&self) -> Vec<f64> {
        let host = self.host();
        if self.is_contiguous() {
            return host[..self.len].to_vec();
        }
        host.iter().step_by(self.stride).take(self.len).copied().collect()
    }

    /// Unpack contiguous logical elements back into host memory.
    pub fn scatter(&mut self, packed: &[f64]) -> Result<()> {
        if packed.len() != self.len {
            return Err(ExecutionError::ShapeMismatch(format!(
                "scatter of {} elements into array of {}",
                packed.len(),
                self.len
            )));
        }
        let stride = self.stride;
        match &mut self.data {
            HostData::Input(_) => Err(ExecutionError::ShapeMismatch(
                "cannot write back into an input array".to_string(),
            )),
            HostData::InOut(host) => {
                for (dst, src) in host.iter_mut().step_by(stride).zip(packed) {
                    *dst = *src;
                }
                Ok(())
            }
        }
    }

    /// Raw view of the contiguous logical data, for transfers.
    pub(crate) fn host_slice(&self) -> HostSlice {
        HostSlice::from_slice(&self.host()[..self.len])
    }

    fn host(&self) -> &[f64] {
        match &self.data {
            HostData::Input(host) => host,
            HostData::InOut(host) => host,
        }
    }
}

fn check_stride(host_len: usize, len: usize, stride: usize) -> Result<()> {
    if stride == 0 {
        return Err(ExecutionError::ShapeMismatch(
            "stride must be at least 1".to_string(),
        ));
    }
    if len == 0 {
        return Ok(());
    }
    let required = (len - 1)
        .checked_mul(stride)
        .and_then(|v| v.checked_add(1))
        .ok_or_else(|| ExecutionError::ShapeMismatch("strided extent overflows".to_string()))?;
    if required > host_len {
        return Err(ExecutionError::ShapeMismatch(format!(
            "{} elements with stride {} need {} host elements, have {}",
            len, stride, required, host_len
        )));
    }
    Ok(())
}
