//! Pattern graph evaluator — graph + time → one RGB8 frame.
//!
//! Evaluation is demand-driven from the output node, memoized per node for a
//! single call, so a generator shared by several consumers runs once. Missing
//! wires, unknown node kinds and absent parameters all degrade to defaults;
//! the only failure is a cycle.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::color::{build_gradient_lut, lut_sample, rotate_hue, Rgb8, LUT_STEPS};
use crate::frame::{PixelFrame, CHANNEL_LEN, PIXEL_COUNT};
use crate::graph::{Graph, NodeData, NodeKind, PortType};

/// Windows narrower than this are treated as a hard step.
const MIN_WINDOW: f64 = 1e-9;

// ── Pixel map ────────────────────────────────────────────────────────────────

/// Logical pixel index → physical LED index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelMap {
    table: Vec<usize>,
}

impl PixelMap {
    pub fn identity(pixel_count: usize) -> Self {
        Self {
            table: (0..pixel_count).collect(),
        }
    }

    /// Build a map from an explicit table. Must be a permutation of
    /// `0..table.len()`.
    pub fn from_table(table: Vec<usize>) -> Result<Self, MapError> {
        let mut seen = vec![false; table.len()];
        for (logical, &physical) in table.iter().enumerate() {
            let slot = seen.get_mut(physical).ok_or(MapError::OutOfRange {
                logical,
                physical,
                len: table.len(),
            })?;
            if *slot {
                return Err(MapError::Duplicate(physical));
            }
            *slot = true;
        }
        Ok(Self { table })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn physical(&self, logical: usize) -> usize {
        self.table.get(logical).copied().unwrap_or(logical)
    }

    pub fn is_identity(&self) -> bool {
        self.table.iter().enumerate().all(|(i, &p)| i == p)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("map entry {logical} → {physical} is outside 0..{len}")]
    OutOfRange {
        logical: usize,
        physical: usize,
        len: usize,
    },
    #[error("physical index {0} is mapped twice")]
    Duplicate(usize),
    #[error("map has {map} entries but the strip has {pixels} pixels")]
    LengthMismatch { map: usize, pixels: usize },
}

// ── Engine config ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub pixel_count: usize,
    pub channel_len: usize,
    map: PixelMap,
}

impl EngineConfig {
    pub fn new(pixel_count: usize, channel_len: usize) -> Self {
        Self {
            pixel_count,
            channel_len,
            map: PixelMap::identity(pixel_count),
        }
    }

    pub fn with_map(mut self, map: PixelMap) -> Result<Self, MapError> {
        if map.len() != self.pixel_count {
            return Err(MapError::LengthMismatch {
                map: map.len(),
                pixels: self.pixel_count,
            });
        }
        self.map = map;
        Ok(self)
    }

    pub fn map(&self) -> &PixelMap {
        &self.map
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(PIXEL_COUNT, CHANNEL_LEN)
    }
}

// ── Errors / stats ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("graph contains a cycle through node {0:?}")]
    CyclicGraph(String),
}

/// Per-call counters, mostly useful to observe memoization.
#[derive(Debug, Clone, Default)]
pub struct EvalStats {
    evaluations: HashMap<String, usize>,
}

impl EvalStats {
    /// How many times `node_id` was actually computed (memo hits excluded).
    pub fn evaluations_of(&self, node_id: &str) -> usize {
        self.evaluations.get(node_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.evaluations.values().sum()
    }
}

// ── Evaluator ────────────────────────────────────────────────────────────────

/// Stateless apart from its configuration; safe to share across threads.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    config: EngineConfig,
}

impl Evaluator {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn evaluate(&self, graph: &Graph, time_ms: f64) -> Result<PixelFrame, GraphError> {
        self.evaluate_with_stats(graph, time_ms).map(|(frame, _)| frame)
    }

    pub fn evaluate_with_stats(
        &self,
        graph: &Graph,
        time_ms: f64,
    ) -> Result<(PixelFrame, EvalStats), GraphError> {
        let n = self.config.pixel_count;
        let mut frame = PixelFrame::black(n);

        let Some(out) = graph.output_node() else {
            return Ok((frame, EvalStats::default()));
        };

        let mut pass = Pass::new(graph, n, time_ms);
        let pixels = pass.eval_node(&out.id)?;

        for (logical, &px) in pixels.iter().enumerate() {
            frame.set_pixel(self.config.map.physical(logical), px);
        }

        tracing::trace!(
            output = %out.id,
            evaluated = pass.stats.total(),
            peak = frame.peak(),
            "frame evaluated"
        );
        Ok((frame, pass.stats))
    }
}

type Pixels = Rc<[Rgb8]>;

/// State for one `evaluate` call.
struct Pass<'g> {
    graph: &'g Graph,
    n: usize,
    time_ms: f64,
    black: Pixels,
    memo: HashMap<&'g str, Pixels>,
    visiting: HashSet<&'g str>,
    stats: EvalStats,
}

impl<'g> Pass<'g> {
    fn new(graph: &'g Graph, n: usize, time_ms: f64) -> Self {
        Self {
            graph,
            n,
            time_ms,
            black: vec![Rgb8::BLACK; n].into(),
            memo: HashMap::new(),
            visiting: HashSet::new(),
            stats: EvalStats::default(),
        }
    }

    fn eval_node(&mut self, id: &'g str) -> Result<Pixels, GraphError> {
        if let Some(hit) = self.memo.get(id) {
            return Ok(hit.clone());
        }
        let graph = self.graph;
        let Some((node, kind)) = graph.node(id) else {
            return Ok(self.black.clone());
        };
        if !self.visiting.insert(&node.id) {
            return Err(GraphError::CyclicGraph(node.id.clone()));
        }

        let pixels = match kind {
            NodeKind::Gradient => self.gradient(node),
            NodeKind::HueShift => self.hue_shift(node)?,
            NodeKind::Blend => self.blend(node)?,
            NodeKind::Output => match graph.source_of(&node.id, "color") {
                Some(_) => self.input(node, "color")?,
                None => self.first_connected(node)?,
            },
            NodeKind::Unknown => self.first_connected(node)?,
        };

        self.visiting.remove(node.id.as_str());
        *self.stats.evaluations.entry(node.id.clone()).or_default() += 1;
        self.memo.insert(&node.id, pixels.clone());
        Ok(pixels)
    }

    /// Pixels arriving at `(node, port)`, or black when nothing is wired.
    fn input(&mut self, node: &'g NodeData, port: &str) -> Result<Pixels, GraphError> {
        let graph = self.graph;
        match graph.source_of(&node.id, port) {
            Some(src) => self.eval_node(&src.node_id),
            None => Ok(self.black.clone()),
        }
    }

    /// First wired input in declared port order, then in wire order.
    fn first_connected(&mut self, node: &'g NodeData) -> Result<Pixels, GraphError> {
        let graph = self.graph;
        let declared = node
            .inputs
            .iter()
            .find_map(|p| graph.source_of(&node.id, &p.id));
        let src = declared.or_else(|| graph.wired_inputs(&node.id).first().map(|(_, s)| s));
        match src {
            Some(src) => self.eval_node(&src.node_id),
            None => Ok(self.black.clone()),
        }
    }

    fn gradient(&self, node: &NodeData) -> Pixels {
        let a = node.number(&["start"], 0.0) / 100.0;
        let b = node.number(&["end"], 100.0) / 100.0;
        let lut = build_gradient_lut(
            node.color("startColor", Rgb8::BLACK),
            node.color("endColor", Rgb8::WHITE),
            LUT_STEPS,
        );

        let span = (self.n.max(2) - 1) as f64;
        (0..self.n)
            .map(|i| {
                let u = i as f64 / span;
                let t = if (b - a).abs() < MIN_WINDOW {
                    if u >= a {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    ((u - a) / (b - a)).clamp(0.0, 1.0)
                };
                lut_sample(&lut, (t * (LUT_STEPS - 1) as f64).round() as usize)
            })
            .collect()
    }

    fn hue_shift(&mut self, node: &'g NodeData) -> Result<Pixels, GraphError> {
        let src = if self.graph.source_of(&node.id, "input").is_some() {
            self.input(node, "input")?
        } else {
            let port = node
                .inputs
                .iter()
                .find(|p| p.port_type == PortType::Color)
                .map(|p| p.id.as_str());
            match port {
                Some(port) => self.input(node, port)?,
                None => self.black.clone(),
            }
        };

        let degrees =
            node.number(&["hue", "amount"], 0.0) + node.number(&["speed"], 0.0) * self.time_ms / 1000.0;
        if degrees.rem_euclid(360.0) == 0.0 {
            return Ok(src);
        }
        let turns = degrees / 360.0;
        Ok(src.iter().map(|&c| rotate_hue(c, turns)).collect())
    }

    fn blend(&mut self, node: &'g NodeData) -> Result<Pixels, GraphError> {
        let a = self.input(node, "a")?;
        let b = self.input(node, "b")?;
        let mix = (node.number(&["blend", "mix"], 50.0) / 100.0).clamp(0.0, 1.0);
        let mode = BlendMode::parse(node.text("mode"));

        Ok(a.iter()
            .zip(b.iter())
            .map(|(&x, &y)| {
                let target = mode.apply(x, y);
                Rgb8::new(
                    lerp_channel(x.r, target.r, mix),
                    lerp_channel(x.g, target.g, mix),
                    lerp_channel(x.b, target.b, mix),
                )
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlendMode {
    Mix,
    Add,
    Multiply,
    Screen,
}

impl BlendMode {
    fn parse(text: Option<&str>) -> Self {
        match text.map(str::to_ascii_lowercase).as_deref() {
            Some("add") => BlendMode::Add,
            Some("multiply") => BlendMode::Multiply,
            Some("screen") => BlendMode::Screen,
            _ => BlendMode::Mix,
        }
    }

    /// Full-strength result of the mode; the mix amount lerps towards it.
    fn apply(self, a: Rgb8, b: Rgb8) -> Rgb8 {
        let per = |f: fn(u16, u16) -> u16| {
            Rgb8::new(
                f(a.r.into(), b.r.into()) as u8,
                f(a.g.into(), b.g.into()) as u8,
                f(a.b.into(), b.b.into()) as u8,
            )
        };
        match self {
            BlendMode::Mix => b,
            BlendMode::Add => per(|x, y| (x + y).min(255)),
            BlendMode::Multiply => per(|x, y| (x * y + 127) / 255),
            BlendMode::Screen => per(|x, y| 255 - ((255 - x) * (255 - y) + 127) / 255),
        }
    }
}

fn lerp_channel(a: u8, b: u8, t: f64) -> u8 {
    let (a, b) = (f64::from(a), f64::from(b));
    (a + (b - a) * t).round().clamp(0.0, 255.0) as u8
}
