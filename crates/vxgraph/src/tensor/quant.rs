//! Quantization descriptors attached to tensors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Quantization family, without parameters. Constraint tables match on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantKind {
    #[default]
    None,
    Dfp,
    Affine,
    AffineSymmetric,
    PerChannel,
}

impl QuantKind {
    /// Prefix used in constraint diagnostics. Unquantized types have none.
    pub fn name(self) -> &'static str {
        match self {
            QuantKind::None => "",
            QuantKind::Dfp => "DFP",
            QuantKind::Affine => "ASYM",
            QuantKind::AffineSymmetric => "SYMM",
            QuantKind::PerChannel => "SYMM PC",
        }
    }
}

impl fmt::Display for QuantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Quantization parameters of a tensor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Quantization {
    #[default]
    None,
    /// Dynamic fixed point with `fl` fractional bits.
    Dfp { fl: i8 },
    Affine { scale: f32, zero_point: i32 },
    AffineSymmetric { scale: f32 },
    PerChannel {
        scales: Vec<f32>,
        zero_points: Vec<i32>,
        axis: usize,
    },
}

impl Quantization {
    pub fn kind(&self) -> QuantKind {
        match self {
            Quantization::None => QuantKind::None,
            Quantization::Dfp { .. } => QuantKind::Dfp,
            Quantization::Affine { .. } => QuantKind::Affine,
            Quantization::AffineSymmetric { .. } => QuantKind::AffineSymmetric,
            Quantization::PerChannel { .. } => QuantKind::PerChannel,
        }
    }

    pub fn is_quantized(&self) -> bool {
        !matches!(self, Quantization::None)
    }

    /// Real value of one quantized step. Per-channel tensors report their first channel.
    pub fn scale(&self) -> f32 {
        match self {
            Quantization::None => 1.0,
            Quantization::Dfp { fl } => 2f32.powi(-i32::from(*fl)),
            Quantization::Affine { scale, .. } | Quantization::AffineSymmetric { scale } => *scale,
            Quantization::PerChannel { scales, .. } => scales.first().copied().unwrap_or(1.0),
        }
    }

    pub fn zero_point(&self) -> i32 {
        match self {
            Quantization::Affine { zero_point, .. } => *zero_point,
            Quantization::PerChannel { zero_points, .. } => {
                zero_points.first().copied().unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Maps a stored value to its real value.
    pub fn dequantize(&self, stored: f32) -> f32 {
        match self {
            Quantization::None => stored,
            _ => (stored - self.zero_point() as f32) * self.scale(),
        }
    }

    /// Maps a real value to its stored value, before rounding and clamping.
    pub fn quantize(&self, real: f32) -> f32 {
        match self {
            Quantization::None => real,
            _ => real / self.scale() + self.zero_point() as f32,
        }
    }
}
