//! k1-core — color math, pattern graph evaluation, frame post-processing,
//! and the TLV upload codec. Pure and synchronous; `k1-link` and `k1-ctl`
//! depend on this one.

pub mod color;
pub mod config;
pub mod eval;
pub mod export;
pub mod frame;
pub mod graph;
pub mod wire;

pub use color::Rgb8;
pub use eval::{EngineConfig, EvalStats, Evaluator, GraphError, PixelMap};
pub use frame::{apply_brightness_cap, PixelFrame};
pub use graph::{Graph, NodeData, NodeKind, Wire};
pub use config::{K1Config, LinkConfig};
pub use export::GraphExport;
pub use wire::{crc32, make_put_plan, PutPlan, Tlv, TlvType, WireError, PUT_DATA_MAX};
