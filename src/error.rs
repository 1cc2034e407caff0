use std::error::Error;
use std::fmt;

/// Checked dereference failed: the pointer value is null, or it left the
/// payload of the block the handle is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrError {
    msg: &'static str,
}

impl PtrError {
    pub(crate) const NULL: Self = Self {
        msg: "dereference of null handle",
    };
    pub(crate) const OUT_OF_BOUNDS: Self = Self {
        msg: "dereference outside attached block",
    };

    /// Short description of the failed check.
    pub fn message(&self) -> &'static str {
        self.msg
    }
}

impl fmt::Display for PtrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.msg)
    }
}

impl Error for PtrError {}

/// The underlying raw allocation failed, or the requested size overflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    size: usize,
}

impl AllocError {
    pub(crate) fn new(size: usize) -> Self {
        Self { size }
    }

    /// Buffer size, in bytes, that could not be allocated.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocation of {} bytes failed", self.size)
    }
}

impl Error for AllocError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        assert_eq!(PtrError::NULL.message(), "dereference of null handle");
        assert_eq!(
            PtrError::OUT_OF_BOUNDS.to_string(),
            "dereference outside attached block"
        );
        assert_eq!(AllocError::new(512).to_string(), "allocation of 512 bytes failed");
    }
}
