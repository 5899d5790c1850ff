use super::StringPool;
use crate::core::error::{ResError, Result};
use crate::core::stream::{ExtDataInput, ExtDataOutput};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// A typed value as stored in table entries and XML attributes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResValue {
    pub size: u16,
    pub res0: u8,
    pub data_type: u8,
    pub data: u32,
}

impl ResValue {
    pub const SIZE: u16 = 8;

    pub fn new(ty: ResValueType, data: u32) -> Self {
        Self::new_raw(ty as u8, data)
    }

    pub fn new_raw(data_type: u8, data: u32) -> Self {
        Self {
            size: Self::SIZE,
            res0: 0,
            data_type,
            data,
        }
    }

    pub fn reference(id: ResId) -> Self {
        Self::new(ResValueType::Reference, id.into())
    }

    pub fn read<R: Read>(r: &mut ExtDataInput<R>) -> Result<Self> {
        let size = r.read_u16()?;
        let res0 = r.read_u8()?;
        let data_type = r.read_u8()?;
        let data = r.read_u32()?;
        Ok(Self {
            size,
            res0,
            data_type,
            data,
        })
    }

    pub fn write<W: Write>(&self, w: &mut ExtDataOutput<W>) -> Result<()> {
        w.write_u16(self.size)?;
        w.write_u8(self.res0)?;
        w.write_u8(self.data_type)?;
        w.write_u32(self.data)?;
        Ok(())
    }

    pub fn ty(&self) -> Option<ResValueType> {
        ResValueType::from_u8(self.data_type)
    }

    /// The referenced id for reference and attribute values.
    pub fn referenced_id(&self) -> Option<ResId> {
        match self.ty()? {
            ResValueType::Reference
            | ResValueType::Attribute
            | ResValueType::DynamicReference
            | ResValueType::DynamicAttribute
                if self.data != 0 =>
            {
                Some(ResId::from(self.data))
            }
            _ => None,
        }
    }

    /// Text form of every value that can be rendered without looking up
    /// another resource. References yield `None` unless they are null.
    pub fn format_plain(&self, strings: &StringPool) -> Option<String> {
        let data = self.data;
        let ty = match self.ty() {
            Some(ty) => ty,
            None => return Some(format!("0x{:08x}", data)),
        };
        Some(match ty {
            ResValueType::Null => match data {
                1 => "@empty".to_string(),
                _ => "@null".to_string(),
            },
            ResValueType::Reference | ResValueType::DynamicReference if data == 0 => {
                "@null".to_string()
            }
            ResValueType::Reference
            | ResValueType::Attribute
            | ResValueType::DynamicReference
            | ResValueType::DynamicAttribute => return None,
            ResValueType::String => strings.get(data).unwrap_or_default().to_string(),
            ResValueType::Float => format_float(f32::from_bits(data)),
            ResValueType::Dimension => format!(
                "{}{}",
                format_float(complex_to_float(data)),
                DIMENSION_UNITS
                    .get((data & COMPLEX_UNIT_MASK) as usize)
                    .copied()
                    .unwrap_or("")
            ),
            ResValueType::Fraction => format!(
                "{}{}",
                format_float(complex_to_float(data) * 100.0),
                FRACTION_UNITS
                    .get((data & COMPLEX_UNIT_MASK) as usize)
                    .copied()
                    .unwrap_or("")
            ),
            ResValueType::IntDec => (data as i32).to_string(),
            ResValueType::IntHex => format!("0x{:x}", data),
            ResValueType::IntBoolean => (data != 0).to_string(),
            ResValueType::IntColorArgb8 => format!("#{:08x}", data),
            ResValueType::IntColorRgb8 => format!("#{:06x}", data & 0xff_ffff),
            ResValueType::IntColorArgb4 => format!(
                "#{:x}{:x}{:x}{:x}",
                (data >> 28) & 0xf,
                (data >> 20) & 0xf,
                (data >> 12) & 0xf,
                (data >> 4) & 0xf
            ),
            ResValueType::IntColorRgb4 => format!(
                "#{:x}{:x}{:x}",
                (data >> 20) & 0xf,
                (data >> 12) & 0xf,
                (data >> 4) & 0xf
            ),
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ResValueType {
    Null = 0x00,
    Reference = 0x01,
    Attribute = 0x02,
    String = 0x03,
    Float = 0x04,
    Dimension = 0x05,
    Fraction = 0x06,
    DynamicReference = 0x07,
    DynamicAttribute = 0x08,
    IntDec = 0x10,
    IntHex = 0x11,
    IntBoolean = 0x12,
    IntColorArgb8 = 0x1c,
    IntColorRgb8 = 0x1d,
    IntColorArgb4 = 0x1e,
    IntColorRgb4 = 0x1f,
}

impl ResValueType {
    pub fn from_u8(ty: u8) -> Option<Self> {
        Some(match ty {
            x if x == Self::Null as u8 => Self::Null,
            x if x == Self::Reference as u8 => Self::Reference,
            x if x == Self::Attribute as u8 => Self::Attribute,
            x if x == Self::String as u8 => Self::String,
            x if x == Self::Float as u8 => Self::Float,
            x if x == Self::Dimension as u8 => Self::Dimension,
            x if x == Self::Fraction as u8 => Self::Fraction,
            x if x == Self::DynamicReference as u8 => Self::DynamicReference,
            x if x == Self::DynamicAttribute as u8 => Self::DynamicAttribute,
            x if x == Self::IntDec as u8 => Self::IntDec,
            x if x == Self::IntHex as u8 => Self::IntHex,
            x if x == Self::IntBoolean as u8 => Self::IntBoolean,
            x if x == Self::IntColorArgb8 as u8 => Self::IntColorArgb8,
            x if x == Self::IntColorRgb8 as u8 => Self::IntColorRgb8,
            x if x == Self::IntColorArgb4 as u8 => Self::IntColorArgb4,
            x if x == Self::IntColorRgb4 as u8 => Self::IntColorRgb4,
            _ => return None,
        })
    }

    pub fn is_attribute(self) -> bool {
        matches!(self, Self::Attribute | Self::DynamicAttribute)
    }
}

const COMPLEX_UNIT_MASK: u32 = 0xf;
const COMPLEX_RADIX_SHIFT: u32 = 4;
const COMPLEX_MANTISSA_MASK: u32 = 0xffff_ff00;
const RADIX_MULTS: [f32; 4] = [
    1.0 / (1u64 << 8) as f32,
    1.0 / (1u64 << 15) as f32,
    1.0 / (1u64 << 23) as f32,
    1.0 / (1u64 << 31) as f32,
];
const DIMENSION_UNITS: [&str; 6] = ["px", "dip", "sp", "pt", "in", "mm"];
const FRACTION_UNITS: [&str; 2] = ["%", "%p"];

/// Decode the mantissa and radix of a dimension or fraction.
pub fn complex_to_float(data: u32) -> f32 {
    let mantissa = (data & COMPLEX_MANTISSA_MASK) as i32 as f32;
    mantissa * RADIX_MULTS[((data >> COMPLEX_RADIX_SHIFT) & 3) as usize]
}

fn format_float(value: f32) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

/// A resource identifier: `0xPPTTEEEE`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResId(u32);

impl ResId {
    pub fn new(package: u8, ty: u8, entry: u16) -> Self {
        let package = (package as u32) << 24;
        let ty = (ty as u32) << 16;
        let entry = entry as u32;
        Self(package | ty | entry)
    }

    pub fn package(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn ty(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn entry(self) -> u16 {
        self.0 as u16
    }
}

impl From<u32> for ResId {
    fn from(r: u32) -> Self {
        Self(r)
    }
}

impl From<ResId> for u32 {
    fn from(r: ResId) -> u32 {
        r.0
    }
}

impl std::fmt::Display for ResId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// A symbolic reference such as `@android:style/Theme` or `?attr/colorAccent`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResRef<'a> {
    pub package: Option<&'a str>,
    pub ty: &'a str,
    pub name: &'a str,
    pub attribute: bool,
}

impl<'a> ResRef<'a> {
    pub fn parse(s: &'a str) -> Result<Self> {
        let (attribute, rest) = if let Some(rest) = s.strip_prefix('@') {
            (false, rest)
        } else if let Some(rest) = s.strip_prefix('?') {
            (true, rest)
        } else {
            return Err(ResError::InvalidString(format!(
                "invalid reference {}: expected `@` or `?`",
                s
            )));
        };
        let (descr, name) = rest.split_once('/').ok_or_else(|| {
            ResError::InvalidString(format!("invalid reference {}: expected `/`", s))
        })?;
        let (package, ty) = if let Some((package, ty)) = descr.split_once(':') {
            (Some(package), ty)
        } else {
            (None, descr)
        };
        Ok(Self {
            package,
            ty,
            name,
            attribute,
        })
    }
}

impl std::fmt::Display for ResRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(if self.attribute { "?" } else { "@" })?;
        if let Some(package) = self.package {
            write!(f, "{}:", package)?;
        }
        write!(f, "{}/{}", self.ty, self.name)
    }
}
