//! Export document: the graph plus preview and metadata, as uploaded to the
//! device and saved by the CLI.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::eval::EngineConfig;
use crate::frame::PixelFrame;
use crate::graph::{Graph, NodeData, Wire};
use crate::wire::MAX_SEQUENCE_FRAMES;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMeta {
    pub pixel_count: usize,
    pub color_format: String,
    pub fps: f64,
    /// `linear` for the identity map, `custom` otherwise.
    pub mapping: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness_cap: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ExportMeta {
    pub fn new(config: &EngineConfig, fps: f64) -> Self {
        Self {
            pixel_count: config.pixel_count,
            color_format: "rgb8".to_string(),
            fps,
            mapping: if config.map().is_identity() {
                "linear".to_string()
            } else {
                "custom".to_string()
            },
            brightness_cap: None,
            note: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramesMeta {
    pub pixel_count: usize,
    pub channel_len: usize,
    pub fps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphExport {
    pub nodes: Vec<NodeData>,
    pub wires: Vec<Wire>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_meta: Option<FramesMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ExportMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<Vec<u8>>>,
    #[serde(default)]
    pub exported_at: String,
}

impl GraphExport {
    /// Build an export stamped with the current UTC time.
    pub fn new(nodes: Vec<NodeData>, wires: Vec<Wire>, config: &EngineConfig, fps: f64) -> Self {
        Self {
            nodes,
            wires,
            params: Map::new(),
            preview: None,
            frames_meta: Some(FramesMeta {
                pixel_count: config.pixel_count,
                channel_len: config.channel_len,
                fps,
            }),
            meta: Some(ExportMeta::new(config, fps)),
            frames: None,
            exported_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }

    pub fn with_preview(mut self, frame: &PixelFrame) -> Self {
        self.preview = Some(frame.as_bytes().to_vec());
        self
    }

    pub fn with_brightness_cap(mut self, cap: u8) -> Self {
        if let Some(meta) = self.meta.as_mut() {
            meta.brightness_cap = (cap < u8::MAX).then_some(cap);
        }
        self
    }

    pub fn with_frames(mut self, frames: Vec<Vec<u8>>) -> Self {
        self.frames = Some(frames);
        self.clamp_frames(MAX_SEQUENCE_FRAMES);
        self
    }

    /// Truncate `frames` to `max` entries, noting the clamp in `meta`.
    /// Returns true if anything was dropped.
    pub fn clamp_frames(&mut self, max: usize) -> bool {
        let Some(frames) = self.frames.as_mut() else {
            return false;
        };
        if frames.len() <= max {
            return false;
        }
        tracing::debug!(from = frames.len(), to = max, "clamping export frames");
        frames.truncate(max);
        if let Some(meta) = self.meta.as_mut() {
            meta.note = Some(format!("Frames clamped to {max} for payload size."));
        }
        true
    }

    /// Ingest the document's nodes and wires.
    pub fn to_graph(&self) -> Graph {
        Graph::new(self.nodes.clone(), &self.wires)
    }

    /// Compact JSON bytes, the upload payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
