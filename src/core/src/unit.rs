//! Build unit and its wire codec.
//!
//! A [`BuildUnit`] is what a worker receives: the image a step starts from,
//! the diff produced by earlier steps that this worker has not seen yet, the
//! instruction to run, and the options to run it with. The transport form is
//! [`WireUnit`], which has no report sink field, so a live output stream can
//! never end up on the wire.

use crate::error::{BuildError, Result};
use crate::instruction::Instruction;
use crate::options::{default_allowed_build_args, BuildOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

/// Live output stream for executor progress.
pub type ReportSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Wrap a writer as a report sink.
pub fn report_sink<W: Write + Send + 'static>(writer: W) -> ReportSink {
    Arc::new(Mutex::new(Box::new(writer)))
}

/// One build step's worth of state.
#[derive(Clone)]
pub struct BuildUnit {
    /// Image id or name the step starts from
    pub base_image_ref: String,
    /// Changes from earlier steps not yet materialized here
    pub accumulated_diff: Vec<u8>,
    pub instruction: Option<Instruction>,
    pub build_options: BuildOptions,
    pub allowed_build_args: BTreeSet<String>,
    /// Never encoded
    pub report_sink: Option<ReportSink>,
}

impl std::fmt::Debug for BuildUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildUnit")
            .field("base_image_ref", &self.base_image_ref)
            .field("accumulated_diff_len", &self.accumulated_diff.len())
            .field("instruction", &self.instruction)
            .field("build_options", &self.build_options)
            .field("allowed_build_args", &self.allowed_build_args)
            .field("report_sink", &self.report_sink.is_some())
            .finish()
    }
}

impl BuildUnit {
    /// First step of a build: no diff, default options.
    pub fn new(base_image_ref: impl Into<String>, instruction: Instruction) -> Self {
        Self {
            base_image_ref: base_image_ref.into(),
            accumulated_diff: Vec::new(),
            instruction: Some(instruction),
            build_options: BuildOptions::default(),
            allowed_build_args: default_allowed_build_args(),
            report_sink: None,
        }
    }

    pub fn with_diff(mut self, diff: Vec<u8>) -> Self {
        self.accumulated_diff = diff;
        self
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.build_options = options;
        self
    }

    /// Attach a local output stream.
    pub fn with_report_sink(mut self, sink: ReportSink) -> Self {
        self.report_sink = Some(sink);
        self
    }

    /// Move the accumulated diff out, leaving it empty.
    pub fn take_diff(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.accumulated_diff)
    }

    /// Transport form of this unit.
    pub fn to_wire(&self) -> WireUnit {
        WireUnit {
            base_image_ref: self.base_image_ref.clone(),
            accumulated_diff: self.accumulated_diff.clone(),
            instruction: self.instruction.clone(),
            build_options: self.build_options.clone(),
            allowed_build_args: self.allowed_build_args.clone(),
        }
    }

    /// Encode to the JSON wire form. The report sink is not included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.to_wire().encode()
    }

    /// Decode a unit received over the wire. The report sink is unset.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(WireUnit::decode(bytes)?.into_unit())
    }
}

/// Serializable form of a [`BuildUnit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUnit {
    pub base_image_ref: String,
    #[serde(default, with = "base64_bytes")]
    pub accumulated_diff: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<Instruction>,
    #[serde(default)]
    pub build_options: BuildOptions,
    #[serde(default = "default_allowed_build_args")]
    pub allowed_build_args: BTreeSet<String>,
}

impl WireUnit {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: WireUnit =
            serde_json::from_slice(bytes).map_err(|e| BuildError::Decode(e.to_string()))?;
        if wire.base_image_ref.trim().is_empty() {
            return Err(BuildError::Decode("baseImageRef is empty".to_string()));
        }
        Ok(wire)
    }

    pub fn into_unit(self) -> BuildUnit {
        BuildUnit {
            base_image_ref: self.base_image_ref,
            accumulated_diff: self.accumulated_diff,
            instruction: self.instruction,
            build_options: self.build_options,
            allowed_build_args: self.allowed_build_args,
            report_sink: None,
        }
    }
}

/// Base64 text for byte fields; `null` decodes as empty.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD.decode(text).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
