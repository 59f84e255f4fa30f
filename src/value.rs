//! Typed search values and the predicates derived from them.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

const F32_EPSILON: f32 = 1e-5;
const F64_EPSILON: f64 = 1e-9;

/// All types are scanned at their natural alignment, except raw bytes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Bytes = 0u8,
    I8 = 1u8,
    I16 = 2u8,
    I32 = 3u8,
    I64 = 4u8,
    F32 = 5u8,
    F64 = 6u8,
}

impl Type {
    /// The fixed width of the type. `Bytes` has no fixed width and reports 0.
    pub fn byte_size(self) -> usize {
        match self {
            Type::Bytes => 0,
            Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 => 4,
            Type::I64 => 8,
            Type::F32 => 4,
            Type::F64 => 8,
        }
    }

    /// The fixed width in bits, 0 for `Bytes`.
    pub fn bit_size(self) -> usize {
        self.byte_size() * 8
    }
}

impl fmt::Display for Type {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::Bytes => "bytes",
            Type::I8 => "i8",
            Type::I16 => "i16",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::F32 => "f32",
            Type::F64 => "f64",
        };

        name.fmt(fmt)
    }
}

/// How a float search treats values that were stored with more precision than
/// the user typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloatOption {
    /// Exact bit-pattern match.
    #[default]
    None,
    /// `round(x)` equals the target: `[r - 0.5, r + 0.5)`.
    Rounded,
    /// `floor(x)` or `ceil(x)` equals the target: `[v - 1 + eps, v + 1)`.
    Extreme,
    /// `trunc(x)` equals the target: `[t, t + 1)`.
    Truncated,
}

/// A typed search value with its little-endian byte encoding.
#[derive(Debug, Clone)]
pub struct Value {
    ty: Type,
    data: Vec<u8>,
    option: FloatOption,
}

impl Value {
    pub fn from_i8(v: i8) -> Value {
        Value {
            ty: Type::I8,
            data: vec![v as u8],
            option: FloatOption::None,
        }
    }

    pub fn from_i16(v: i16) -> Value {
        let mut data = vec![0u8; 2];
        LittleEndian::write_i16(&mut data, v);
        Value {
            ty: Type::I16,
            data,
            option: FloatOption::None,
        }
    }

    pub fn from_i32(v: i32) -> Value {
        let mut data = vec![0u8; 4];
        LittleEndian::write_i32(&mut data, v);
        Value {
            ty: Type::I32,
            data,
            option: FloatOption::None,
        }
    }

    pub fn from_i64(v: i64) -> Value {
        let mut data = vec![0u8; 8];
        LittleEndian::write_i64(&mut data, v);
        Value {
            ty: Type::I64,
            data,
            option: FloatOption::None,
        }
    }

    pub fn from_f32(v: f32, option: FloatOption) -> Value {
        let mut data = vec![0u8; 4];
        LittleEndian::write_f32(&mut data, v);
        Value {
            ty: Type::F32,
            data,
            option,
        }
    }

    pub fn from_f64(v: f64, option: FloatOption) -> Value {
        let mut data = vec![0u8; 8];
        LittleEndian::write_f64(&mut data, v);
        Value {
            ty: Type::F64,
            data,
            option,
        }
    }

    /// A raw byte pattern. Length must be between 1 and 1024.
    pub fn from_bytes(b: &[u8]) -> Value {
        debug_assert!(!b.is_empty() && b.len() <= 1024);

        Value {
            ty: Type::Bytes,
            data: b.to_vec(),
            option: FloatOption::None,
        }
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn option(&self) -> FloatOption {
        self.option
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// The width of one occurrence in target memory.
    pub fn size(&self) -> usize {
        match self.ty {
            Type::Bytes => self.data.len(),
            ty => ty.byte_size(),
        }
    }

    /// Whether occurrences are expected at addresses aligned to their width.
    pub fn aligned(&self) -> bool {
        self.ty != Type::Bytes
    }

    /// Whether a float comparison option applies to this value.
    pub fn has_option(&self) -> bool {
        matches!(self.ty, Type::F32 | Type::F64) && self.option != FloatOption::None
    }

    /// Overwrite the encoded bytes in place, keeping the type.
    pub fn set_bytes(&mut self, b: &[u8]) {
        let n = self.data.len().min(b.len());
        self.data[..n].copy_from_slice(&b[..n]);
    }

    pub fn equal_bytes(&self, b: &[u8]) -> bool {
        self.data[..] == *b
    }

    /// A byte guaranteed to differ from the first encoded byte. Written into
    /// skipped scatter-read slots so stale buffer contents cannot match.
    pub fn disturb_byte(&self) -> u8 {
        !self.data[0]
    }

    pub fn to_f32(&self) -> f32 {
        LittleEndian::read_f32(&self.data)
    }

    pub fn to_f64(&self) -> f64 {
        LittleEndian::read_f64(&self.data)
    }

    /// The comparison predicate for this value: an interval test for floats
    /// carrying an option, raw byte equality for everything else.
    pub fn comparable(&self) -> Comparable {
        match (self.ty, self.option) {
            (Type::F32, option) if option != FloatOption::None => {
                let v = self.to_f32();

                let (min, max) = match option {
                    FloatOption::Rounded => {
                        let r = v.round();
                        (r - 0.5, r + 0.5)
                    }
                    FloatOption::Extreme => (v - 1.0 + F32_EPSILON, v + 1.0),
                    _ => {
                        let t = v.trunc();
                        (t, t + 1.0)
                    }
                };

                Comparable::RangeF32 {
                    min,
                    max,
                    first: self.data[0],
                }
            }
            (Type::F64, option) if option != FloatOption::None => {
                let v = self.to_f64();

                let (min, max) = match option {
                    FloatOption::Rounded => {
                        let r = v.round();
                        (r - 0.5, r + 0.5)
                    }
                    FloatOption::Extreme => (v - 1.0 + F64_EPSILON, v + 1.0),
                    _ => {
                        let t = v.trunc();
                        (t, t + 1.0)
                    }
                };

                Comparable::RangeF64 {
                    min,
                    max,
                    first: self.data[0],
                }
            }
            _ => Comparable::Bytes {
                data: self.data.clone(),
            },
        }
    }

    /// Render the value for display: decimal for integers, the shortest float
    /// representation for floats, hex pairs for raw bytes.
    pub fn format(&self) -> String {
        match self.ty {
            Type::Bytes => {
                let mut out = String::with_capacity(self.data.len() * 3);

                for (i, b) in self.data.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }

                    out.push_str(&format!("{:02X}", b));
                }

                out
            }
            Type::I8 => (self.data[0] as i8).to_string(),
            Type::I16 => LittleEndian::read_i16(&self.data).to_string(),
            Type::I32 => LittleEndian::read_i32(&self.data).to_string(),
            Type::I64 => LittleEndian::read_i64(&self.data).to_string(),
            Type::F32 => self.to_f32().to_string(),
            Type::F64 => self.to_f64().to_string(),
        }
    }
}

/// The comparison capability derived from a [`Value`].
///
/// A tagged variant rather than a trait object: the matcher picks a path once
/// per chunk, and refinement scans test millions of slots through it.
#[derive(Debug, Clone)]
pub enum Comparable {
    Bytes { data: Vec<u8> },
    RangeF32 { min: f32, max: f32, first: u8 },
    RangeF64 { min: f64, max: f64, first: u8 },
}

impl Comparable {
    /// The width of one tested slot.
    pub fn size(&self) -> usize {
        match self {
            Comparable::Bytes { data } => data.len(),
            Comparable::RangeF32 { .. } => 4,
            Comparable::RangeF64 { .. } => 8,
        }
    }

    /// Test a slot read from target memory.
    pub fn equal_bytes(&self, b: &[u8]) -> bool {
        match self {
            Comparable::Bytes { data } => data[..] == *b,
            Comparable::RangeF32 { min, max, .. } => {
                let v = LittleEndian::read_f32(b);
                v >= *min && v < *max
            }
            Comparable::RangeF64 { min, max, .. } => {
                let v = LittleEndian::read_f64(b);
                v >= *min && v < *max
            }
        }
    }

    /// See [`Value::disturb_byte`].
    pub fn disturb_byte(&self) -> u8 {
        match self {
            Comparable::Bytes { data } => !data[0],
            Comparable::RangeF32 { first, .. } => !*first,
            Comparable::RangeF64 { first, .. } => !*first,
        }
    }
}
