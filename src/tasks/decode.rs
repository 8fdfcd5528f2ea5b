//! # Decode Task
//!
//! Reference task module that turns an encoded pixel frame into native
//! little-endian samples and computes its smallest/largest pixel values.
//!
//! Request payload:
//!
//! ```json
//! {
//!   "transferSyntax": "1.2.840.10008.1.2.1",
//!   "imageFrame": { "rows": 512, "columns": 512, "bitsAllocated": 16, "pixelRepresentation": 0 }
//! }
//! ```
//!
//! The encoded bytes travel as the first transfer buffer. On success the
//! response payload is the image frame with `smallestPixelValue`,
//! `largestPixelValue` and `pixelDataLength` filled in, and the decoded bytes
//! come back as the only transfer buffer.
//!
//! Initialization payload: `{ "decodeTask": { "initializeCodecsOnStartup": bool, "strict": bool } }`.

use anyhow::{anyhow, Context as _};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info};

use super::pixel::{calculate_min_max, decode_frame, ImageFrame, PixelError, TransferSyntax};
use crate::execution::{Completion, HandlerRegistry, TaskModule, TransferBuffer, TransferList};

pub const TASK_TYPE: &str = "decodeTask";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeConfig {
    #[serde(default)]
    pub initialize_codecs_on_startup: bool,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecodeRequest {
    transfer_syntax: String,
    image_frame: ImageFrame,
}

/// UID → decoder lookup, built once per instance
#[derive(Debug)]
struct CodecTable {
    syntaxes: HashMap<&'static str, TransferSyntax>,
}

impl CodecTable {
    fn load() -> Self {
        let syntaxes = TransferSyntax::ALL
            .into_iter()
            .map(|syntax| (syntax.uid(), syntax))
            .collect();
        Self { syntaxes }
    }

    fn lookup(&self, uid: &str) -> Result<TransferSyntax, PixelError> {
        self.syntaxes
            .get(uid.trim())
            .copied()
            .ok_or_else(|| PixelError::UnsupportedTransferSyntax(uid.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct DecodeTask {
    config: DecodeConfig,
    codecs: Option<CodecTable>,
    codec_loads: u32,
}

impl DecodeTask {
    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    pub fn codecs_loaded(&self) -> bool {
        self.codecs.is_some()
    }

    /// Number of times the codec table was actually built (0 or 1)
    pub fn codec_loads(&self) -> u32 {
        self.codec_loads
    }

    fn load_codecs(&mut self) -> &CodecTable {
        if self.codecs.is_none() {
            self.codec_loads += 1;
            debug!(codecs = TransferSyntax::ALL.len(), "Loading decode codecs");
        }
        self.codecs.get_or_insert_with(CodecTable::load)
    }

    /// Decode one request into the response payload and the decoded bytes
    pub fn decode(
        &mut self,
        payload: serde_json::Value,
        mut transfer: TransferList,
    ) -> anyhow::Result<(serde_json::Value, Vec<u8>)> {
        let strict = self.config.strict;
        let request: DecodeRequest =
            serde_json::from_value(payload).context("invalid decode request")?;
        let syntax = self.load_codecs().lookup(&request.transfer_syntax)?;

        if transfer.is_empty() {
            return Err(anyhow!("no encoded pixel buffer in transfer list"));
        }
        let encoded = transfer.swap_remove(0);

        let mut frame = request.image_frame;
        let pixels = decode_frame(&frame, syntax, encoded.as_slice())?;
        if pixels.is_empty() {
            return Err(PixelError::EmptyPixelData.into());
        }

        calculate_min_max(&mut frame, &pixels, strict)?;

        let bytes = pixels.into_le_bytes();
        frame.pixel_data_length = Some(bytes.len());
        let result = serde_json::to_value(&frame).context("failed to serialize image frame")?;

        Ok((result, bytes))
    }
}

impl TaskModule for DecodeTask {
    fn initialize(&mut self, config: &serde_json::Value) -> anyhow::Result<()> {
        self.config = match config.get(TASK_TYPE) {
            Some(section) => DecodeConfig::deserialize(section)
                .context("invalid decodeTask configuration")?,
            None => DecodeConfig::default(),
        };

        if self.config.initialize_codecs_on_startup {
            self.load_codecs();
        }

        info!(
            strict = self.config.strict,
            codecs_loaded = self.codecs_loaded(),
            "Decode task initialized"
        );
        Ok(())
    }

    fn handle(&mut self, payload: serde_json::Value, transfer: TransferList, completion: Completion) {
        match self.decode(payload, transfer) {
            Ok((frame, bytes)) => {
                completion.complete(frame, vec![TransferBuffer::new(bytes)]);
            }
            Err(e) => {
                completion.fail(format!("decodeTask: {e:#}"));
            }
        }
    }
}

/// Registry holding only the decode task, for use with `ThreadFactory`
pub fn decode_registry() -> HandlerRegistry {
    HandlerRegistry::new().with(TASK_TYPE, DecodeTask::default())
}
