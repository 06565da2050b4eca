//! Haar cascade face detector.
//!
//! Evaluates boosted Haar cascades stored in OpenCV's XML format (the
//! `haarcascade_frontalface_default.xml` family) with OpenCV's multi-scale
//! sliding-window and rectangle-grouping semantics.

use crate::image_ops::resize_bilinear;
use crate::types::FaceRect;
use image::GrayImage;
use roxmltree::Node;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

// --- Named constants (match OpenCV's detectMultiScale defaults) ---
pub const SCALE_FACTOR: f64 = 1.1;
pub const MIN_NEIGHBORS: usize = 5;
const GROUP_EPS: f64 = 0.2;
const STAGE_THRESHOLD_EPS: f32 = 1e-5;
const MIN_VARIANCE_RATIO: f64 = 0.1;
const MAX_RECTS_PER_FEATURE: usize = 3;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}; install OpenCV's haarcascades data or point FACEGATE_CASCADE_PATH at it")]
    NotFound(String),
    #[error("cannot read cascade file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("invalid cascade: {0}")]
    Invalid(String),
    #[error("scale factor must be greater than 1.0, got {0}")]
    BadScaleFactor(f64),
}

fn invalid(msg: impl Into<String>) -> CascadeError {
    CascadeError::Invalid(msg.into())
}

#[derive(Debug, Clone)]
struct WeightedRect {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    weight: f32,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

impl HaarFeature {
    fn calc(&self, ii: &Integral, x: usize, y: usize) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight as f64 * ii.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

/// Split node of a weak classifier tree. Non-positive children are leaf indices.
#[derive(Debug, Clone)]
struct TreeNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<TreeNode>,
    leaves: Vec<f32>,
}

impl WeakClassifier {
    fn eval(&self, mut feature_value: impl FnMut(usize) -> f32) -> f32 {
        let mut idx = 0usize;
        loop {
            let node = &self.nodes[idx];
            let next = if feature_value(node.feature) < node.threshold {
                node.left
            } else {
                node.right
            };
            if next <= 0 {
                return self.leaves[next.unsigned_abs() as usize];
            }
            idx = next as usize;
        }
    }
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f32,
    classifiers: Vec<WeakClassifier>,
}

/// Summed-area tables over one pyramid level.
struct Integral {
    width: usize,
    height: usize,
    sum: Vec<i64>,
    sqsum: Vec<i64>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let width = img.width() as usize;
        let height = img.height() as usize;
        let stride = width + 1;
        let raw = img.as_raw();

        let mut sum = vec![0i64; stride * (height + 1)];
        let mut sqsum = vec![0i64; stride * (height + 1)];

        for y in 0..height {
            let mut row_sum = 0i64;
            let mut row_sq = 0i64;
            for x in 0..width {
                let v = raw[y * width + x] as i64;
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sqsum[(y + 1) * stride + x + 1] = sqsum[y * stride + x + 1] + row_sq;
            }
        }

        Self {
            width,
            height,
            sum,
            sqsum,
        }
    }

    fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> i64 {
        Self::area(&self.sum, self.width + 1, x, y, w, h)
    }

    fn sqsum(&self, x: usize, y: usize, w: usize, h: usize) -> i64 {
        Self::area(&self.sqsum, self.width + 1, x, y, w, h)
    }

    fn area(table: &[i64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> i64 {
        let (x1, y1) = (x + w, y + h);
        table[y1 * stride + x1] - table[y * stride + x1] - table[y1 * stride + x]
            + table[y * stride + x]
    }
}

/// A loaded boosted Haar cascade.
#[derive(Debug, Clone)]
pub struct CascadeClassifier {
    window_width: usize,
    window_height: usize,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl CascadeClassifier {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: &str) -> Result<Self, CascadeError> {
        if !Path::new(path).exists() {
            return Err(CascadeError::NotFound(path.to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&xml)?;

        tracing::info!(
            path,
            window = ?(cascade.window_width, cascade.window_height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse the `<cascade>` element of an OpenCV cascade document.
    ///
    /// Old-style cascades (`<trees>` under each stage) must be re-saved with
    /// a current OpenCV before they can be used here.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(xml)?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| {
                invalid("no <cascade> element; old-style cascade files are not supported")
            })?;

        let stage_type = text(child(root, "stageType")?);
        if stage_type != "BOOST" {
            return Err(invalid(format!("unsupported stage type {stage_type}")));
        }
        let feature_type = text(child(root, "featureType")?);
        if feature_type != "HAAR" {
            return Err(invalid(format!("unsupported feature type {feature_type}")));
        }

        let window_width: usize = scalar(child(root, "width")?)?;
        let window_height: usize = scalar(child(root, "height")?)?;
        if window_width < 3 || window_height < 3 {
            return Err(invalid(format!("window {window_width}x{window_height} is too small")));
        }

        let features = items(child(root, "features")?)
            .map(|n| parse_feature(n, window_width, window_height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = items(child(root, "stages")?)
            .map(|n| parse_stage(n, features.len()))
            .collect::<Result<Vec<_>, _>>()?;
        if stages.is_empty() {
            return Err(invalid("cascade has no stages"));
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Detection window size at scale 1, as `(width, height)`.
    pub fn window_size(&self) -> (usize, usize) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Detect objects at every scale `scale_factor^k` that fits the image.
    ///
    /// Candidate windows are grouped; clusters with `min_neighbors` or fewer
    /// members are discarded. `min_neighbors == 0` returns the raw candidates.
    pub fn detect_multi_scale(
        &self,
        gray: &GrayImage,
        scale_factor: f64,
        min_neighbors: usize,
    ) -> Result<Vec<FaceRect>, CascadeError> {
        if scale_factor.is_nan() || scale_factor <= 1.0 {
            return Err(CascadeError::BadScaleFactor(scale_factor));
        }

        let (img_w, img_h) = (gray.width() as f64, gray.height() as f64);
        let mut candidates = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let win_w = (self.window_width as f64 * factor).round();
            let win_h = (self.window_height as f64 * factor).round();
            if win_w > img_w || win_h > img_h {
                break;
            }

            let scaled_w = (img_w / factor).round() as u32;
            let scaled_h = (img_h / factor).round() as u32;
            if scaled_w as usize <= self.window_width || scaled_h as usize <= self.window_height {
                break;
            }

            let integral = if factor == 1.0 {
                Integral::new(gray)
            } else {
                Integral::new(&resize_bilinear(gray, scaled_w, scaled_h))
            };
            self.scan_level(&integral, factor, (win_w as i32, win_h as i32), &mut candidates);

            factor *= scale_factor;
        }

        tracing::trace!(candidates = candidates.len(), "cascade scan finished");
        Ok(group_rectangles(candidates, min_neighbors, GROUP_EPS))
    }

    fn scan_level(
        &self,
        ii: &Integral,
        factor: f64,
        window: (i32, i32),
        out: &mut Vec<FaceRect>,
    ) {
        let step = if factor > 2.0 { 1 } else { 2 };
        let max_x = ii.width - self.window_width;
        let max_y = ii.height - self.window_height;

        for y in (0..=max_y).step_by(step) {
            let mut x = 0;
            while x <= max_x {
                let result = self.run_at(ii, x, y);
                if result > 0 {
                    out.push(FaceRect::new(
                        (x as f64 * factor).round() as i32,
                        (y as f64 * factor).round() as i32,
                        window.0,
                        window.1,
                    ));
                }
                if result == 0 {
                    x += step;
                }
                x += step;
            }
        }
    }

    /// Returns 1 if the window passes every stage, otherwise minus the index
    /// of the rejecting stage. Windows whose pixel standard deviation is at
    /// most `1 / MIN_VARIANCE_RATIO` are rejected before any stage with -1.
    fn run_at(&self, ii: &Integral, x: usize, y: usize) -> i32 {
        let (nw, nh) = (self.window_width - 2, self.window_height - 2);
        let area = (nw * nh) as f64;
        let s = ii.sum(x + 1, y + 1, nw, nh) as f64;
        let sq = ii.sqsum(x + 1, y + 1, nw, nh) as f64;
        let nf = area * sq - s * s;
        if nf <= 0.0 {
            return -1;
        }
        let nf = nf.sqrt();
        if area / nf >= MIN_VARIANCE_RATIO {
            return -1;
        }
        let inv_norm = 1.0 / nf;

        for (idx, stage) in self.stages.iter().enumerate() {
            let sum: f32 = stage
                .classifiers
                .iter()
                .map(|weak| weak.eval(|f| (self.features[f].calc(ii, x, y) * inv_norm) as f32))
                .sum();
            if sum < stage.threshold - STAGE_THRESHOLD_EPS {
                return -(idx as i32);
            }
        }
        1
    }
}

/// Cluster similar rectangles and average each cluster.
///
/// Clusters with `group_threshold` or fewer members are dropped, as are
/// clusters that sit inside a stronger neighbouring cluster.
fn group_rectangles(rects: Vec<FaceRect>, group_threshold: usize, eps: f64) -> Vec<FaceRect> {
    if group_threshold == 0 || rects.is_empty() {
        return rects;
    }

    let (labels, classes) = partition(&rects, eps);

    let mut sums = vec![[0i64; 4]; classes];
    let mut weights = vec![0usize; classes];
    for (rect, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += rect.x as i64;
        s[1] += rect.y as i64;
        s[2] += rect.width as i64;
        s[3] += rect.height as i64;
        weights[label] += 1;
    }

    let averaged: Vec<FaceRect> = sums
        .iter()
        .zip(&weights)
        .map(|(s, &n)| {
            let inv = 1.0 / n as f64;
            FaceRect::new(
                (s[0] as f64 * inv).round() as i32,
                (s[1] as f64 * inv).round() as i32,
                (s[2] as f64 * inv).round() as i32,
                (s[3] as f64 * inv).round() as i32,
            )
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = weights[i];
        if n1 <= group_threshold {
            continue;
        }

        let swallowed = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = weights[j];
            if j == i || n2 <= group_threshold {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i32;
            let dy = (r2.height as f64 * eps).round() as i32;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width <= r2.x + r2.width + dx
                && r1.y + r1.height <= r2.y + r2.height + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !swallowed {
            grouped.push(*r1);
        }
    }

    grouped
}

fn similar(a: &FaceRect, b: &FaceRect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    (a.x - b.x).abs() as f64 <= delta
        && (a.y - b.y).abs() as f64 <= delta
        && (a.x + a.width - b.x - b.width).abs() as f64 <= delta
        && (a.y + a.height - b.y - b.height).abs() as f64 <= delta
}

/// Equivalence classes under the transitive closure of `similar`.
/// Class labels are numbered in order of first appearance.
fn partition(rects: &[FaceRect], eps: f64) -> (Vec<usize>, usize) {
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let a = find(&mut parent, i);
                let b = find(&mut parent, j);
                if a != b {
                    parent[a.max(b)] = a.min(b);
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

// --- XML helpers ---

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Result<Node<'a, 'i>, CascadeError> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .ok_or_else(|| invalid(format!("<{}> has no <{name}> element", node.tag_name().name())))
}

/// Element children of a sequence node (`<_>` entries).
fn items<'a, 'i>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|n| n.is_element())
}

fn text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn scalar<T: FromStr>(node: Node<'_, '_>) -> Result<T, CascadeError> {
    let raw = text(node);
    raw.parse()
        .map_err(|_| invalid(format!("bad value {raw:?} in <{}>", node.tag_name().name())))
}

fn numbers(node: Node<'_, '_>) -> Result<Vec<f64>, CascadeError> {
    text(node)
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| invalid(format!("bad number {tok:?} in <{}>", node.tag_name().name())))
        })
        .collect()
}

fn as_int(v: f64) -> Result<i64, CascadeError> {
    if v.fract() != 0.0 {
        return Err(invalid(format!("expected an integer, got {v}")));
    }
    Ok(v as i64)
}

fn parse_feature(
    node: Node<'_, '_>,
    win_w: usize,
    win_h: usize,
) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = node.children().find(|n| n.has_tag_name("tilted")) {
        if text(tilted) != "0" {
            return Err(invalid("tilted Haar features are not supported"));
        }
    }

    let rects = items(child(node, "rects")?)
        .map(|r| {
            let v = numbers(r)?;
            if v.len() != 5 {
                return Err(invalid(format!("feature rect needs 5 values, got {}", v.len())));
            }
            let (x, y, w, h) = (as_int(v[0])?, as_int(v[1])?, as_int(v[2])?, as_int(v[3])?);
            if x < 0 || y < 0 || w <= 0 || h <= 0 || x + w > win_w as i64 || y + h > win_h as i64 {
                return Err(invalid(format!("feature rect {x} {y} {w} {h} leaves the window")));
            }
            Ok(WeightedRect {
                x: x as usize,
                y: y as usize,
                width: w as usize,
                height: h as usize,
                weight: v[4] as f32,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if rects.is_empty() || rects.len() > MAX_RECTS_PER_FEATURE {
        return Err(invalid(format!("feature has {} rects", rects.len())));
    }
    Ok(HaarFeature { rects })
}

fn parse_stage(node: Node<'_, '_>, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold: f32 = scalar(child(node, "stageThreshold")?)?;
    let classifiers = items(child(node, "weakClassifiers")?)
        .map(|n| parse_weak(n, feature_count))
        .collect::<Result<Vec<_>, _>>()?;
    if classifiers.is_empty() {
        return Err(invalid("stage has no weak classifiers"));
    }
    Ok(Stage {
        threshold,
        classifiers,
    })
}

fn parse_weak(node: Node<'_, '_>, feature_count: usize) -> Result<WeakClassifier, CascadeError> {
    let raw_nodes = numbers(child(node, "internalNodes")?)?;
    let leaves: Vec<f32> = numbers(child(node, "leafValues")?)?
        .into_iter()
        .map(|v| v as f32)
        .collect();

    if raw_nodes.is_empty() || raw_nodes.len() % 4 != 0 {
        return Err(invalid(format!("internalNodes has {} values", raw_nodes.len())));
    }

    let node_count = raw_nodes.len() / 4;
    let mut nodes = Vec::with_capacity(node_count);
    for (i, chunk) in raw_nodes.chunks(4).enumerate() {
        let left = as_int(chunk[0])?;
        let right = as_int(chunk[1])?;
        let feature = as_int(chunk[2])?;

        if feature < 0 || feature as usize >= feature_count {
            return Err(invalid(format!("feature index {feature} out of range")));
        }
        for next in [left, right] {
            let ok = if next > 0 {
                (next as usize) > i && (next as usize) < node_count
            } else {
                (next.unsigned_abs() as usize) < leaves.len()
            };
            if !ok {
                return Err(invalid(format!("tree link {next} out of range")));
            }
        }

        nodes.push(TreeNode {
            left: left as i32,
            right: right as i32,
            feature: feature as usize,
            threshold: chunk[3] as f32,
        });
    }

    Ok(WeakClassifier { nodes, leaves })
}

/// Haar-cascade face detector with fixed multi-scale parameters.
pub struct HaarFaceDetector {
    cascade: CascadeClassifier,
    scale_factor: f64,
    min_neighbors: usize,
}

impl HaarFaceDetector {
    pub fn new(cascade: CascadeClassifier) -> Self {
        Self::with_params(cascade, SCALE_FACTOR, MIN_NEIGHBORS)
    }

    pub fn with_params(
        cascade: CascadeClassifier,
        scale_factor: f64,
        min_neighbors: usize,
    ) -> Self {
        Self {
            cascade,
            scale_factor,
            min_neighbors,
        }
    }

    pub fn load(path: &str) -> Result<Self, CascadeError> {
        Ok(Self::new(CascadeClassifier::load(path)?))
    }
}

impl crate::pipeline::FaceDetector for HaarFaceDetector {
    fn detect(&self, gray: &GrayImage) -> Result<Vec<FaceRect>, CascadeError> {
        self.cascade
            .detect_multi_scale(gray, self.scale_factor, self.min_neighbors)
    }
}
