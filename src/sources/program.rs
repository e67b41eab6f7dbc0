//! Decoders and the external-program data source.
//!
//! A decoder turns a raw payload into a [`DataHolder`]. The payload comes either
//! from a client key (string or byte array) or from the standard output of a
//! command. Decoders are resolved by name when the configuration is compiled.

use super::{DataSource, ReadContext};
use crate::data::{DataHolder, Value};
use crate::error::{WriterError, WriterResult};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use std::fmt;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Converts a raw payload into a holder.
pub trait Decoder: Send + Sync {
    /// Registered name.
    fn name(&self) -> &str;

    /// Decode `raw`. The error string becomes a `SourceFormat` reason.
    fn decode(&self, raw: &[u8]) -> Result<DataHolder, String>;
}

/// Parses UTF-8 JSON and classifies the result.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn name(&self) -> &str {
        "json"
    }

    fn decode(&self, raw: &[u8]) -> Result<DataHolder, String> {
        let value: serde_json::Value = serde_json::from_slice(raw).map_err(|e| e.to_string())?;
        DataHolder::from_json(&value).map_err(|e| e.to_string())
    }
}

/// Interprets the payload as one UTF-8 string.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Decoder;

impl Decoder for Utf8Decoder {
    fn name(&self) -> &str {
        "utf8"
    }

    fn decode(&self, raw: &[u8]) -> Result<DataHolder, String> {
        let text = std::str::from_utf8(raw).map_err(|e| e.to_string())?;
        Ok(DataHolder::scalar(text.trim_end_matches(['\n', '\r'])))
    }
}

/// Magic number opening a video image frame ("VDEO").
pub const VIDEO_IMAGE_MAGIC: u32 = 0x5644_454f;
const VIDEO_IMAGE_HEADER: usize = 32;

/// Decodes a video image frame.
///
/// The frame is a 32-byte big-endian header followed by the pixel block:
///
/// ```text
/// magic u32 | version u16 | mode u16 | frame i64 | width u32 | height u32 |
/// endianness u16 | header_size u16 | padding 4 bytes
/// ```
///
/// `mode` selects the pixel depth (0: 8 bit, 1: 16 bit, 2: 32 bit, 3: 64 bit),
/// `endianness` the pixel byte order (0: little, 1: big). The result is an
/// IMAGE of unsigned integers with shape `[height, width]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct VideoImageDecoder;

impl Decoder for VideoImageDecoder {
    fn name(&self) -> &str {
        "VIDEO_IMAGE"
    }

    fn decode(&self, raw: &[u8]) -> Result<DataHolder, String> {
        if raw.len() < VIDEO_IMAGE_HEADER {
            return Err(format!("frame of {} bytes has no complete header", raw.len()));
        }
        let mut header = &raw[..VIDEO_IMAGE_HEADER];
        let magic = header.get_u32();
        if magic != VIDEO_IMAGE_MAGIC {
            return Err(format!("bad magic {magic:#010x}"));
        }
        let _version = header.get_u16();
        let mode = header.get_u16();
        let _frame = header.get_i64();
        let width = header.get_u32() as usize;
        let height = header.get_u32() as usize;
        let big_endian = header.get_u16() == 1;
        let header_size = usize::from(header.get_u16()).max(VIDEO_IMAGE_HEADER);

        let depth = match mode {
            0 => 1,
            1 => 2,
            2 => 4,
            3 => 8,
            other => return Err(format!("unsupported pixel mode {other}")),
        };
        let count = width
            .checked_mul(height)
            .ok_or_else(|| "frame dimensions overflow".to_string())?;
        let needed = count
            .checked_mul(depth)
            .and_then(|block| block.checked_add(header_size))
            .ok_or_else(|| "frame dimensions overflow".to_string())?;
        if raw.len() < needed {
            return Err(format!("frame truncated: {} of {needed} bytes", raw.len()));
        }
        let mut pixels = &raw[header_size..needed];
        // Bounded by the payload length checked above.
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let pixel = match (depth, big_endian) {
                (1, _) => u64::from(pixels.get_u8()),
                (2, true) => u64::from(pixels.get_u16()),
                (2, false) => u64::from(pixels.get_u16_le()),
                (4, true) => u64::from(pixels.get_u32()),
                (4, false) => u64::from(pixels.get_u32_le()),
                (_, true) => pixels.get_u64(),
                (_, false) => pixels.get_u64_le(),
            };
            values.push(Value::UInt(pixel));
        }
        DataHolder::from_parts(crate::data::ElementType::UInt64, vec![height, width], values)
            .map_err(|e| e.to_string())
    }
}

/// Where the raw payload comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramInput {
    /// Client key holding a string or an array of bytes
    Record(String),
    /// Command line whose standard output is the payload
    Command(Vec<String>),
}

/// Runs a decoder over a raw payload.
#[derive(Clone)]
pub struct ProgramSource {
    decoder: Arc<dyn Decoder>,
    input: ProgramInput,
}

impl fmt::Debug for ProgramSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramSource")
            .field("decoder", &self.decoder.name())
            .field("input", &self.input)
            .finish()
    }
}

impl ProgramSource {
    /// Source feeding `input` to `decoder`.
    pub fn new(decoder: Arc<dyn Decoder>, input: ProgramInput) -> Self {
        Self { decoder, input }
    }

    async fn raw(&self, ctx: &ReadContext) -> WriterResult<Option<Bytes>> {
        match &self.input {
            ProgramInput::Record(key) => match ctx.lookup(key) {
                None => Ok(None),
                Some(serde_json::Value::String(s)) => Ok(Some(Bytes::from(s.clone()))),
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .map(|item| {
                        item.as_u64()
                            .and_then(|b| u8::try_from(b).ok())
                            .ok_or_else(|| {
                                WriterError::format(self.describe(), "payload is not a byte array")
                            })
                    })
                    .collect::<WriterResult<Vec<u8>>>()
                    .map(|bytes| Some(Bytes::from(bytes))),
                Some(other) => Err(WriterError::format(
                    self.describe(),
                    format!("cannot decode client value {other}"),
                )),
            },
            ProgramInput::Command(argv) => {
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| WriterError::unavailable(self.describe(), "empty command"))?;
                debug!(program = %program, "running decoder input command");
                let output = Command::new(program)
                    .args(args)
                    .output()
                    .await
                    .map_err(|e| WriterError::unavailable(self.describe(), e))?;
                if !output.status.success() {
                    return Err(WriterError::unavailable(
                        self.describe(),
                        format!(
                            "'{program}' exited with {}: {}",
                            output.status,
                            String::from_utf8_lossy(&output.stderr).trim()
                        ),
                    ));
                }
                Ok(Some(Bytes::from(output.stdout)))
            }
        }
    }
}

#[async_trait]
impl DataSource for ProgramSource {
    fn describe(&self) -> String {
        match &self.input {
            ProgramInput::Record(key) => format!("PROGRAM:{}({key})", self.decoder.name()),
            ProgramInput::Command(argv) => {
                format!("PROGRAM:{}({})", self.decoder.name(), argv.join(" "))
            }
        }
    }

    async fn read(&self, ctx: &ReadContext) -> WriterResult<Option<DataHolder>> {
        let Some(raw) = self.raw(ctx).await? else {
            return Ok(None);
        };
        self.decoder
            .decode(&raw)
            .map(Some)
            .map_err(|reason| WriterError::format(self.describe(), reason))
    }
}
