//! Structured JSONL record of dispatched calls.
//!
//! A trace is a stream of `TraceRecord` lines:
//! 1. Header (schema version, start time)
//! 2. One `call` record per dispatched invocation
//! 3. Footer (call count, completion status)
//!
//! Outputs are hashed with SHA-256; in audit mode (the default) values
//! larger than `MAX_INLINE_VALUE` bytes are replaced by their hash.

use std::io::Write;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tally_types::FormulaValue;

use crate::dispatch::FunctionId;
use crate::invoke::InvokeError;

/// Current trace schema version.
pub const TRACE_SCHEMA_VERSION: &str = "0.1";

/// Largest value text recorded inline in audit mode.
const MAX_INLINE_VALUE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        source: serde_json::Error,
    },
    #[error("write {what}: {source}")]
    Write {
        what: &'static str,
        source: std::io::Error,
    },
}

/// Tagged trace value; keeps the formula type next to the value.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "t", content = "v")]
pub enum TraceValue {
    Blank,
    Bool(bool),
    Number(f64),
    Decimal(String),
    Str(String),
    DateTime(String),
    Untyped(String),
    Lambda(u32),
    Error { kind: String, message: String },
}

impl TraceValue {
    pub fn from_value(val: &FormulaValue) -> Self {
        match val {
            FormulaValue::Blank => TraceValue::Blank,
            FormulaValue::Boolean(b) => TraceValue::Bool(*b),
            FormulaValue::Number(n) => TraceValue::Number(*n),
            FormulaValue::Decimal(d) => TraceValue::Decimal(d.to_string()),
            FormulaValue::String(s) => TraceValue::Str(s.clone()),
            FormulaValue::DateTime(dt) => TraceValue::DateTime(dt.to_rfc3339()),
            FormulaValue::Untyped(v) => TraceValue::Untyped(v.to_string()),
            FormulaValue::Lambda(id) => TraceValue::Lambda(id.0),
            FormulaValue::Error(e) => TraceValue::Error {
                kind: e.kind.to_string(),
                message: e.message.clone(),
            },
        }
    }

    fn to_hash_string(&self) -> String {
        match self {
            TraceValue::Blank => "Blank()".to_string(),
            TraceValue::Bool(b) => b.to_string(),
            TraceValue::Number(n) => n.to_string(),
            TraceValue::Decimal(s)
            | TraceValue::Str(s)
            | TraceValue::DateTime(s)
            | TraceValue::Untyped(s) => s.clone(),
            TraceValue::Lambda(id) => format!("lambda:{id}"),
            TraceValue::Error { kind, message } => format!("{kind}: {message}"),
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct CallRecord {
    pub seq: u64,
    pub timestamp: String,
    pub function: String,
    pub inputs: Vec<TraceValue>,
    pub output: TraceOutput,
    pub duration_ms: u64,
    pub full_values: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct TraceOutput {
    /// "ok", "error" (error value), "cancelled" or "failed" (hard failure).
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<TraceValue>,
    pub value_hash: String,
    pub value_size: usize,
}

#[derive(Debug, serde::Serialize)]
pub struct TraceHeader {
    pub schema_version: String,
    pub timestamp: String,
    pub full_values: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct TraceFooter {
    pub timestamp: String,
    pub call_count: u64,
    /// "complete" when `finalize` ran.
    pub trace_status: String,
    /// "success", "error" or "cancelled".
    pub program_status: String,
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "record")]
pub enum TraceRecord {
    #[serde(rename = "header")]
    Header(TraceHeader),
    #[serde(rename = "call")]
    Call(CallRecord),
    #[serde(rename = "footer")]
    Footer(TraceFooter),
}

/// Writes call records as JSONL. A disabled tracer accepts records and
/// writes nothing.
pub struct CallTracer {
    seq: u64,
    writer: Option<Box<dyn Write + Send>>,
    full_values: bool,
}

impl std::fmt::Debug for CallTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTracer")
            .field("seq", &self.seq)
            .field("enabled", &self.writer.is_some())
            .finish()
    }
}

impl Default for CallTracer {
    fn default() -> Self {
        Self::disabled()
    }
}

impl CallTracer {
    /// Start a trace on `writer`, emitting the header immediately.
    ///
    /// With `full_values` every output is recorded verbatim; otherwise large
    /// values are replaced by their hash.
    pub fn new(mut writer: Box<dyn Write + Send>, full_values: bool) -> Result<Self, TraceError> {
        let header = TraceRecord::Header(TraceHeader {
            schema_version: TRACE_SCHEMA_VERSION.to_string(),
            timestamp: now_iso8601(),
            full_values,
        });
        write_record(&mut writer, &header, "header")?;
        Ok(Self {
            seq: 0,
            writer: Some(writer),
            full_values,
        })
    }

    pub fn disabled() -> Self {
        Self {
            seq: 0,
            writer: None,
            full_values: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn call_count(&self) -> u64 {
        self.seq
    }

    /// Record one dispatched call and its outcome.
    pub fn record(
        &mut self,
        function: &FunctionId,
        inputs: &[FormulaValue],
        outcome: &Result<FormulaValue, InvokeError>,
        duration: Duration,
    ) -> Result<(), TraceError> {
        let seq = self.seq;
        self.seq += 1;
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let full = self.full_values;

        let (status, value) = match outcome {
            Ok(v @ FormulaValue::Error(_)) => ("error", TraceValue::from_value(v)),
            Ok(v) => ("ok", TraceValue::from_value(v)),
            Err(InvokeError::Cancelled) => ("cancelled", TraceValue::Blank),
            Err(e) => ("failed", TraceValue::Str(e.to_string())),
        };
        let text = value.to_hash_string();
        let value_size = text.len();
        let value_hash = sha256_hex(&text);
        let value = (full || value_size <= MAX_INLINE_VALUE).then_some(value);

        let inputs = inputs
            .iter()
            .map(|v| {
                let tv = TraceValue::from_value(v);
                let s = tv.to_hash_string();
                if !full && s.len() > MAX_INLINE_VALUE {
                    TraceValue::Str(sha256_hex(&s))
                } else {
                    tv
                }
            })
            .collect();

        let record = TraceRecord::Call(CallRecord {
            seq,
            timestamp: now_iso8601(),
            function: function.to_string(),
            inputs,
            output: TraceOutput {
                status: status.to_string(),
                value,
                value_hash,
                value_size,
            },
            duration_ms: duration.as_millis() as u64,
            full_values: full,
        });
        write_record(writer, &record, "call")
    }

    /// Write the footer and flush. `program_status` is "success", "error"
    /// or "cancelled".
    pub fn finalize(&mut self, program_status: &str) -> Result<(), TraceError> {
        let call_count = self.seq;
        if let Some(w) = self.writer.as_mut() {
            let footer = TraceRecord::Footer(TraceFooter {
                timestamp: now_iso8601(),
                call_count,
                trace_status: "complete".to_string(),
                program_status: program_status.to_string(),
            });
            write_record(w, &footer, "footer")?;
            w.flush().map_err(|source| TraceError::Write {
                what: "flush",
                source,
            })?;
        }
        Ok(())
    }
}

fn write_record(
    w: &mut Box<dyn Write + Send>,
    record: &TraceRecord,
    what: &'static str,
) -> Result<(), TraceError> {
    let json =
        serde_json::to_string(record).map_err(|source| TraceError::Serialize { what, source })?;
    writeln!(w, "{}", json).map_err(|source| TraceError::Write { what, source })
}

/// SHA-256 hex digest of a string, prefixed with "sha256:".
fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
