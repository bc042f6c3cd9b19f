//! Periodic variable sampler.
//!
//! The fallback data source when no RTT control block is present: each
//! tick reads the enabled variables over the Link, decodes them, and
//! emits one TAB-separated line terminated by `,\n`, the same frame
//! delimiter RTT consumers use downstream.

use crate::arbitrator::Arbitrator;
use crate::link::{Link, LinkError};
use derive_more::Display;
use serde::Deserialize;
use std::str::FromStr;

/// Decode format of a sampled variable; the byte size follows from it.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, serde_with::DeserializeFromStr,
)]
pub enum VarFormat {
    #[display(fmt = "i8")]
    I8,
    #[display(fmt = "u8")]
    U8,
    #[display(fmt = "i16")]
    I16,
    #[display(fmt = "u16")]
    U16,
    #[display(fmt = "i32")]
    I32,
    #[display(fmt = "u32")]
    U32,
    #[display(fmt = "f32")]
    F32,
    #[display(fmt = "i64")]
    I64,
    #[display(fmt = "u64")]
    U64,
    #[display(fmt = "f64")]
    F64,
}

impl VarFormat {
    pub fn byte_size(&self) -> usize {
        match self {
            VarFormat::I8 | VarFormat::U8 => 1,
            VarFormat::I16 | VarFormat::U16 => 2,
            VarFormat::I32 | VarFormat::U32 | VarFormat::F32 => 4,
            VarFormat::I64 | VarFormat::U64 | VarFormat::F64 => 8,
        }
    }
}

impl FromStr for VarFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "i8" => VarFormat::I8,
            "u8" => VarFormat::U8,
            "i16" => VarFormat::I16,
            "u16" => VarFormat::U16,
            "i32" => VarFormat::I32,
            "u32" => VarFormat::U32,
            "f32" | "float" => VarFormat::F32,
            "i64" => VarFormat::I64,
            "u64" => VarFormat::U64,
            "f64" | "double" => VarFormat::F64,
            _ => return Err(format!("'{s}' is not a sample format")),
        })
    }
}

fn default_enabled() -> bool {
    true
}

/// One watched target variable, as configured by the UI or a variables
/// file. `addr` may be omitted when the name can be resolved through the
/// ELF symbol map.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SampledVariable {
    pub name: String,
    #[serde(default)]
    pub addr: Option<u32>,
    pub format: VarFormat,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Decodes `bytes` (little-endian) per `format` and renders it the way
/// the line protocol expects: decimal integers, `Display` floats.
pub fn render_value(format: VarFormat, bytes: &[u8]) -> Option<String> {
    if bytes.len() != format.byte_size() {
        return None;
    }
    Some(match format {
        VarFormat::I8 => (bytes[0] as i8).to_string(),
        VarFormat::U8 => bytes[0].to_string(),
        VarFormat::I16 => i16::from_le_bytes(bytes.try_into().ok()?).to_string(),
        VarFormat::U16 => u16::from_le_bytes(bytes.try_into().ok()?).to_string(),
        VarFormat::I32 => i32::from_le_bytes(bytes.try_into().ok()?).to_string(),
        VarFormat::U32 => u32::from_le_bytes(bytes.try_into().ok()?).to_string(),
        VarFormat::F32 => f32::from_le_bytes(bytes.try_into().ok()?).to_string(),
        VarFormat::I64 => i64::from_le_bytes(bytes.try_into().ok()?).to_string(),
        VarFormat::U64 => u64::from_le_bytes(bytes.try_into().ok()?).to_string(),
        VarFormat::F64 => f64::from_le_bytes(bytes.try_into().ok()?).to_string(),
    })
}

/// Reads the enabled variables each tick and renders the frame line.
#[derive(Clone, Debug, Default)]
pub struct Sampler {
    vars: Vec<(u32, VarFormat)>,
}

impl Sampler {
    /// Keeps only enabled variables with a resolved address.
    pub fn new(vars: &[SampledVariable]) -> Self {
        Self {
            vars: vars
                .iter()
                .filter(|v| v.enabled)
                .filter_map(|v| v.addr.map(|addr| (addr, v.format)))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// One sampling round: `v0 TAB v1 TAB ... vN , LF`.
    pub fn sample(&self, link: &Link) -> Result<Vec<u8>, LinkError> {
        let mut fields = Vec::with_capacity(self.vars.len());
        for &(addr, format) in &self.vars {
            let raw = link.read_mem(addr, format.byte_size())?;
            fields.push(render_value(format, &raw).unwrap_or_else(|| "0".to_owned()));
            link.arbitrator().after_xact(Some(Arbitrator::VAR_YIELD));
        }
        let mut line = fields.join("\t").into_bytes();
        line.extend_from_slice(b",\n");
        link.arbitrator().after_xact(Some(Arbitrator::RING_YIELD));
        Ok(line)
    }
}
