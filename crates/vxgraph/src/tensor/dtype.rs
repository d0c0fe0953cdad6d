//! Element types understood by operators, kernel tables and drivers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scalar element type of a tensor.
///
/// `None` marks an absent optional operand; it never describes a real buffer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    None,
    Bool8,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    F16,
    BF16,
    #[default]
    F32,
    F64,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::None => 0,
            DType::Bool8 | DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 | DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Stable 8-bit tag. Kernel keys are built by packing these tags.
    pub const fn tag(self) -> u8 {
        match self {
            DType::None => 0,
            DType::Bool8 => 1,
            DType::I8 => 2,
            DType::U8 => 3,
            DType::I16 => 4,
            DType::U16 => 5,
            DType::I32 => 6,
            DType::U32 => 7,
            DType::I64 => 8,
            DType::F16 => 9,
            DType::BF16 => 10,
            DType::F32 => 11,
            DType::F64 => 12,
        }
    }

    /// Reconstructs a `DType` from its tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        let dtype = match tag {
            0 => DType::None,
            1 => DType::Bool8,
            2 => DType::I8,
            3 => DType::U8,
            4 => DType::I16,
            5 => DType::U16,
            6 => DType::I32,
            7 => DType::U32,
            8 => DType::I64,
            9 => DType::F16,
            10 => DType::BF16,
            11 => DType::F32,
            12 => DType::F64,
            _ => return None,
        };
        Some(dtype)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Whether GPU-source kernels can take this type as an operand.
    pub fn is_shader_supported(self) -> bool {
        !matches!(self, DType::I64 | DType::F64)
    }

    /// Name used in constraint diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            DType::None => "Optional",
            DType::Bool8 => "BOOL8",
            DType::I8 => "INT8",
            DType::U8 => "UINT8",
            DType::I16 => "INT16",
            DType::U16 => "UINT16",
            DType::I32 => "INT32",
            DType::U32 => "UINT32",
            DType::I64 => "INT64",
            DType::F16 => "FLOAT16",
            DType::BF16 => "BFLOAT16",
            DType::F32 => "FLOAT32",
            DType::F64 => "FLOAT64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DType; 13] = [
        DType::None,
        DType::Bool8,
        DType::I8,
        DType::U8,
        DType::I16,
        DType::U16,
        DType::I32,
        DType::U32,
        DType::I64,
        DType::F16,
        DType::BF16,
        DType::F32,
        DType::F64,
    ];

    #[test]
    fn tags_are_stable_and_unique() {
        for dtype in ALL {
            assert_eq!(DType::from_tag(dtype.tag()), Some(dtype));
        }
        assert_eq!(DType::from_tag(13), None);
    }

    #[test]
    fn names_match_diagnostic_vocabulary() {
        assert_eq!(DType::I32.name(), "INT32");
        assert_eq!(DType::F16.to_string(), "FLOAT16");
        assert_eq!(DType::None.name(), "Optional");
    }
}
