//! Haar cascade detector over OpenCV cascade XML files.
//!
//! Evaluates boosted Haar-feature cascades (e.g. `haarcascade_frontalface_default.xml`,
//! `haarcascade_eye.xml`) with a sliding window over an image pyramid, then merges
//! neighbouring hits the way OpenCV's `groupRectangles` does.

use crate::detector::RegionDetector;
use crate::types::Region;
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

// --- Scan defaults (match cv::CascadeClassifier::detectMultiScale) ---
const DEFAULT_SCALE_FACTOR: f64 = 1.1;
const DEFAULT_MIN_NEIGHBORS: usize = 3;
const GROUP_EPS: f64 = 0.2;
/// Window stride in pixels once the pyramid scale exceeds this factor drops to 1.
const FINE_STRIDE_FACTOR: f64 = 2.0;
/// Slack subtracted from every stage threshold at load, as OpenCV does.
const STAGE_THRESHOLD_EPS: f32 = 1e-5;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("failed to read cascade {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cascade XML is malformed: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("invalid cascade: {0}")]
    Invalid(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid scan parameters: {0}")]
    InvalidParams(String),
}

/// Sliding-window scan parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanParams {
    /// Pyramid step between scales. Must be > 1.
    pub scale_factor: f64,
    /// Hits a cluster needs beyond this count to be reported. 0 disables grouping.
    pub min_neighbors: usize,
    /// Smallest window (width, height) considered.
    pub min_size: (u32, u32),
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: (0, 0),
        }
    }
}

impl ScanParams {
    pub fn validate(&self) -> Result<(), CascadeError> {
        if !self.scale_factor.is_finite() || self.scale_factor <= 1.0 {
            return Err(CascadeError::InvalidParams(format!(
                "scale factor must be > 1, got {}",
                self.scale_factor
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f32,
}

#[derive(Debug, Clone)]
struct Feature {
    rects: Vec<WeightedRect>,
}

impl Feature {
    /// Weighted rectangle sum for a window anchored at (x, y).
    fn value(&self, ii: &Integral, x: u32, y: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight as f64 * ii.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    /// Child index if > 0, otherwise the negated leaf index.
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<Node>,
    leaves: Vec<f32>,
}

impl WeakClassifier {
    /// Walk the tree from the root using `feature_value` for each split.
    fn predict(&self, mut feature_value: impl FnMut(usize) -> f64) -> f32 {
        let mut idx = 0i32;
        loop {
            let node = &self.nodes[idx as usize];
            idx = if feature_value(node.feature) < node.threshold as f64 {
                node.left
            } else {
                node.right
            };
            if idx <= 0 {
                return self.leaves[(-idx) as usize];
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f32,
    classifiers: Vec<WeakClassifier>,
}

/// Outcome of evaluating the cascade on one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowVerdict {
    Accepted,
    /// Index of the stage whose threshold was not reached.
    RejectedAt(usize),
}

/// A boosted Haar cascade plus the scan parameters it is run with.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<Feature>,
    params: ScanParams,
}

impl HaarCascade {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: &str) -> Result<Self, CascadeError> {
        if !Path::new(path).exists() {
            return Err(CascadeError::NotFound(path.to_string()));
        }
        let xml = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.to_string(),
            source,
        })?;
        let cascade = Self::from_xml_str(&xml)?;

        tracing::info!(
            path,
            window = ?(cascade.window_width, cascade.window_height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse a new-style (`opencv-cascade-classifier`) cascade document.
    pub fn from_xml_str(xml: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(xml)?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| {
                CascadeError::Unsupported("no <cascade> element; old-style cascades are not supported".into())
            })?;

        if let Some(stage_type) = child(root, "stageType") {
            let stage_type = text_of(stage_type);
            if stage_type != "BOOST" {
                return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
            }
        }
        let feature_type = child(root, "featureType")
            .map(text_of)
            .ok_or_else(|| CascadeError::Invalid("missing <featureType>".into()))?;
        if !feature_type.eq_ignore_ascii_case("HAAR") {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }

        let window_width: u32 = parse_child(root, "width")?;
        let window_height: u32 = parse_child(root, "height")?;
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::Invalid(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let stages = required_child(root, "stages")?
            .children()
            .filter(|n| n.is_element())
            .map(parse_stage)
            .collect::<Result<Vec<_>, _>>()?;
        if stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }

        let features = required_child(root, "features")?
            .children()
            .filter(|n| n.is_element())
            .map(parse_feature)
            .collect::<Result<Vec<_>, _>>()?;

        let cascade = Self {
            window_width,
            window_height,
            stages,
            features,
            params: ScanParams::default(),
        };
        cascade.check_consistency()?;
        Ok(cascade)
    }

    /// Replace the scan parameters.
    pub fn with_params(mut self, params: ScanParams) -> Result<Self, CascadeError> {
        params.validate()?;
        self.params = params;
        Ok(self)
    }

    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    /// Verify every index and rectangle stays inside the cascade's own bounds
    /// and every tree only points forward, so evaluation never needs bounds
    /// checks and always reaches a leaf.
    fn check_consistency(&self) -> Result<(), CascadeError> {
        for (fi, feature) in self.features.iter().enumerate() {
            for r in &feature.rects {
                if r.x + r.width > self.window_width || r.y + r.height > self.window_height {
                    return Err(CascadeError::Invalid(format!(
                        "feature {fi} rectangle exceeds the {}x{} window",
                        self.window_width, self.window_height
                    )));
                }
            }
        }

        for (si, stage) in self.stages.iter().enumerate() {
            for wc in &stage.classifiers {
                for (ni, node) in wc.nodes.iter().enumerate() {
                    if node.feature >= self.features.len() {
                        return Err(CascadeError::Invalid(format!(
                            "stage {si} references feature {} of {}",
                            node.feature,
                            self.features.len()
                        )));
                    }
                    for child in [node.left, node.right] {
                        let ok = if child > 0 {
                            (child as usize) > ni && (child as usize) < wc.nodes.len()
                        } else {
                            ((-child) as usize) < wc.leaves.len()
                        };
                        if !ok {
                            return Err(CascadeError::Invalid(format!(
                                "stage {si} node {ni} has an invalid tree reference {child}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Run every stage on the window anchored at (x, y) of the integral image.
    fn evaluate(&self, ii: &Integral, x: u32, y: u32) -> WindowVerdict {
        // Variance normalisation over the window interior.
        let nw = self.window_width - 2;
        let nh = self.window_height - 2;
        let area = (nw as u64 * nh as u64) as f64;
        let sum = ii.sum(x + 1, y + 1, nw, nh) as f64;
        let sqsum = ii.sqsum(x + 1, y + 1, nw, nh) as f64;
        let nf = area * sqsum - sum * sum;
        let inv_norm = if nf > 0.0 { 1.0 / nf.sqrt() } else { 1.0 };

        for (si, stage) in self.stages.iter().enumerate() {
            let mut acc = 0.0f64;
            for wc in &stage.classifiers {
                acc += wc.predict(|f| self.features[f].value(ii, x, y) * inv_norm) as f64;
            }
            if acc < stage.threshold as f64 {
                return WindowVerdict::RejectedAt(si);
            }
        }
        WindowVerdict::Accepted
    }

    /// Multi-scale sliding-window detection, grouped per [`ScanParams`].
    ///
    /// Regions come back in the order their clusters were first hit: smallest
    /// scale first, then top-to-bottom, left-to-right.
    pub fn detect_multi_scale(&self, gray: &GrayImage) -> Vec<Region> {
        let (img_w, img_h) = gray.dimensions();
        let params = &self.params;
        let mut hits = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let win_w = (self.window_width as f64 * factor).round() as u32;
            let win_h = (self.window_height as f64 * factor).round() as u32;
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;

            if scaled_w < self.window_width || scaled_h < self.window_height {
                break;
            }
            if win_w > img_w || win_h > img_h {
                break;
            }

            if win_w >= params.min_size.0 && win_h >= params.min_size.1 {
                let ii = if (scaled_w, scaled_h) == (img_w, img_h) {
                    Integral::new(gray)
                } else {
                    Integral::new(&resize_bilinear(gray, scaled_w, scaled_h))
                };
                let stride = if factor > FINE_STRIDE_FACTOR { 1 } else { 2 };
                let max_x = scaled_w - self.window_width;
                let max_y = scaled_h - self.window_height;

                let mut y = 0;
                while y <= max_y {
                    let mut x = 0;
                    while x <= max_x {
                        match self.evaluate(&ii, x, y) {
                            WindowVerdict::Accepted => hits.push(Region::new(
                                (x as f64 * factor).round() as u32,
                                (y as f64 * factor).round() as u32,
                                win_w,
                                win_h,
                            )),
                            // Windows failing the very first stage skip their neighbour.
                            WindowVerdict::RejectedAt(0) => x += stride,
                            WindowVerdict::RejectedAt(_) => {}
                        }
                        x += stride;
                    }
                    y += stride;
                }
            }

            factor *= params.scale_factor;
        }

        tracing::trace!(raw_hits = hits.len(), width = img_w, height = img_h, "cascade scan");
        group_rectangles(hits, params.min_neighbors, GROUP_EPS)
    }
}

impl RegionDetector for HaarCascade {
    fn detect(&self, gray: &GrayImage) -> Vec<Region> {
        self.detect_multi_scale(gray)
    }
}

// --- XML helpers ---

fn child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn required_child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Result<roxmltree::Node<'a, 'input>, CascadeError> {
    child(node, name).ok_or_else(|| CascadeError::Invalid(format!("missing <{name}>")))
}

fn text_of<'a>(node: roxmltree::Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn parse_child<T: std::str::FromStr>(node: roxmltree::Node, name: &str) -> Result<T, CascadeError> {
    let text = text_of(required_child(node, name)?);
    text.parse()
        .map_err(|_| CascadeError::Invalid(format!("<{name}> is not a number: '{text}'")))
}

fn parse_numbers<T: std::str::FromStr>(text: &str, what: &str) -> Result<Vec<T>, CascadeError> {
    text.split_whitespace()
        .map(|tok| {
            tok.parse()
                .map_err(|_| CascadeError::Invalid(format!("bad number '{tok}' in {what}")))
        })
        .collect()
}

fn parse_stage(node: roxmltree::Node) -> Result<Stage, CascadeError> {
    let threshold: f32 = parse_child(node, "stageThreshold")?;
    let classifiers = required_child(node, "weakClassifiers")?
        .children()
        .filter(|n| n.is_element())
        .map(parse_weak_classifier)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage {
        threshold: threshold - STAGE_THRESHOLD_EPS,
        classifiers,
    })
}

fn parse_weak_classifier(node: roxmltree::Node) -> Result<WeakClassifier, CascadeError> {
    let raw: Vec<f64> = parse_numbers(text_of(required_child(node, "internalNodes")?), "internalNodes")?;
    if raw.is_empty() || raw.len() % 4 != 0 {
        return Err(CascadeError::Unsupported(format!(
            "internalNodes has {} values; only ordered (non-categorical) splits are supported",
            raw.len()
        )));
    }
    let nodes = raw
        .chunks_exact(4)
        .map(|c| {
            if c[2] < 0.0 {
                return Err(CascadeError::Invalid(format!("negative feature index {}", c[2])));
            }
            Ok(Node {
                left: c[0] as i32,
                right: c[1] as i32,
                feature: c[2] as usize,
                threshold: c[3] as f32,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let leaves: Vec<f32> = parse_numbers(text_of(required_child(node, "leafValues")?), "leafValues")?;
    Ok(WeakClassifier { nodes, leaves })
}

fn parse_feature(node: roxmltree::Node) -> Result<Feature, CascadeError> {
    if let Some(tilted) = child(node, "tilted") {
        if text_of(tilted) != "0" {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }
    let rects = required_child(node, "rects")?
        .children()
        .filter(|n| n.is_element())
        .map(|r| {
            let v: Vec<f32> = parse_numbers(text_of(r), "rects")?;
            if v.len() != 5 || v[..4].iter().any(|&c| c < 0.0) {
                return Err(CascadeError::Invalid(format!("malformed feature rectangle {v:?}")));
            }
            Ok(WeightedRect {
                x: v[0] as u32,
                y: v[1] as u32,
                width: v[2] as u32,
                height: v[3] as u32,
                weight: v[4],
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if rects.is_empty() {
        return Err(CascadeError::Invalid("feature without rectangles".into()));
    }
    Ok(Feature { rects })
}

// --- Image helpers ---

/// Summed-area tables of pixel values and squared pixel values.
struct Integral {
    stride: usize,
    sum: Vec<u64>,
    sqsum: Vec<u64>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sqsum = vec![0u64; stride * (h + 1)];
        let pixels = img.as_raw();

        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = pixels[y * w + x] as u64;
                row_sum += p;
                row_sq += p * p;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sqsum[(y + 1) * stride + x + 1] = sqsum[y * stride + x + 1] + row_sq;
            }
        }

        Self { stride, sum, sqsum }
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> i64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sqsum(&self, x: u32, y: u32, w: u32, h: u32) -> i64 {
        Self::rect(&self.sqsum, self.stride, x, y, w, h)
    }

    fn rect(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> i64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] as i64 - table[y0 * stride + x1] as i64 - table[y1 * stride + x0] as i64
            + table[y0 * stride + x0] as i64
    }
}

/// Bilinear resample of a grayscale image (pixel-centre aligned, no antialiasing).
fn resize_bilinear(src: &GrayImage, new_w: u32, new_h: u32) -> GrayImage {
    let (width, height) = (src.width() as usize, src.height() as usize);
    let (new_w, new_h) = (new_w as usize, new_h as usize);
    let inv_scale_x = width as f32 / new_w as f32;
    let inv_scale_y = height as f32 / new_h as f32;
    let frame = src.as_raw();

    let mut resized = vec![0u8; new_w * new_h];
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayImage::from_raw(new_w as u32, new_h as u32, resized)
        .unwrap_or_else(|| GrayImage::new(new_w as u32, new_h as u32))
}

// --- Grouping ---

fn similar(a: &Region, b: &Region, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

/// Label equivalence classes of `rects`, numbered by first appearance.
fn partition(rects: &[Region], eps: f64) -> (Vec<usize>, usize) {
    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj.max(ri)] = ri.min(rj);
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; n];
    let mut labels = vec![0usize; n];
    let mut classes = 0;
    for i in 0..n {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels[i] = class_of_root[root];
    }
    (labels, classes)
}

/// Merge raw window hits into averaged detections.
///
/// Clusters with `group_threshold` or fewer members are dropped, and a cluster
/// lying inside a stronger neighbour is suppressed. A threshold of 0 returns
/// the hits untouched.
pub fn group_rectangles(rects: Vec<Region>, group_threshold: usize, eps: f64) -> Vec<Region> {
    if group_threshold == 0 || rects.is_empty() {
        return rects;
    }

    let (labels, classes) = partition(&rects, eps);
    let mut sums = vec![[0u64; 4]; classes];
    let mut counts = vec![0usize; classes];
    for (r, &label) in rects.iter().zip(labels.iter()) {
        let s = &mut sums[label];
        s[0] += r.x as u64;
        s[1] += r.y as u64;
        s[2] += r.width as u64;
        s[3] += r.height as u64;
        counts[label] += 1;
    }

    let averaged: Vec<Region> = sums
        .iter()
        .zip(counts.iter())
        .map(|(s, &n)| {
            let avg = |v: u64| (v as f64 / n as f64).round() as u32;
            Region::new(avg(s[0]), avg(s[1]), avg(s[2]), avg(s[3]))
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= group_threshold {
            continue;
        }
        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= group_threshold {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1, w1, h1) = (r1.x as i64, r1.y as i64, r1.width as i64, r1.height as i64);
            let (x2, y2, w2, h2) = (r2.x as i64, r2.y as i64, r2.width as i64, r2.height as i64);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + w1 <= x2 + w2 + dx
                && y1 + h1 <= y2 + h2 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            grouped.push(*r1);
        }
    }
    grouped
}
