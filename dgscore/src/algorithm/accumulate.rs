use nalgebra::Matrix3;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::data::binning::{BinGrid, BinningSpec};
use crate::data::events::{EventSet, Frame};
use crate::data::histogram::{BinnedPair, Histogram};
use crate::error::{Result, SliceError};

/// Per-detector sensitivity; detectors missing from `values` use `default`.
///
/// `values` is written as a list of `[detector, sensitivity]` pairs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorSensitivity {
    #[serde(default, serialize_with = "to_pairs", deserialize_with = "from_pairs")]
    pub values: FxHashMap<u32, f64>,
    pub default: f64,
}

fn to_pairs<S: Serializer>(values: &FxHashMap<u32, f64>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    let mut pairs: Vec<(u32, f64)> = values.iter().map(|(k, v)| (*k, *v)).collect();
    pairs.sort_by_key(|p| p.0);
    pairs.serialize(serializer)
}

fn from_pairs<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<FxHashMap<u32, f64>, D::Error> {
    let pairs = Vec::<(u32, f64)>::deserialize(deserializer)?;
    Ok(pairs.into_iter().collect())
}

impl DetectorSensitivity {
    pub fn new(default: f64) -> Self {
        DetectorSensitivity { values: FxHashMap::default(), default }
    }

    pub fn with(mut self, detector: u32, value: f64) -> Self {
        self.values.insert(detector, value);
        self
    }

    pub fn get(&self, detector: u32) -> f64 {
        self.values.get(&detector).copied().unwrap_or(self.default)
    }
}

/// Source of the normalization weights applied to detector trajectories.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum NormalizationSource {
    #[default]
    Unit,
    Constant(f64),
    Sensitivity(DetectorSensitivity),
}

impl NormalizationSource {
    pub fn factor(&self, detector: u32) -> f64 {
        match self {
            NormalizationSource::Unit => 1.0,
            NormalizationSource::Constant(k) => *k,
            NormalizationSource::Sensitivity(map) => map.get(detector),
        }
    }
}

/// Output of one accumulation call: the data pair and, for a jointly
/// accumulated lab-frame background, the background pair on the same grid.
#[derive(Clone, Debug)]
pub struct Accumulation {
    pub data: BinnedPair,
    pub background: Option<BinnedPair>,
}

/// Bins `events` (and a lab-frame `background`) into signal and
/// normalization histograms.
///
/// Every event adds its signal and squared error to the bin it falls in,
/// once per symmetry operation. Every trajectory is clipped against the bin
/// grid and adds `flux · sensitivity · charge` times the fraction of its
/// length inside each bin to the normalization.
///
/// A lab-frame background is angle independent, so it is binned here against
/// the orientations of the data: for sample-frame data it is rotated into the
/// frame of every data run. Sample-frame backgrounds have their own
/// orientations and must go through a separate call.
pub fn accumulate(
    events: &EventSet,
    spec: &BinningSpec,
    normalization: &NormalizationSource,
    background: Option<&EventSet>,
) -> Result<Accumulation> {
    events.validate()?;
    let grid = BinGrid::resolve(spec, events)?;

    debug!(
        name = %events.name,
        events = events.n_events(),
        trajectories = events.trajectories.len(),
        shape = ?grid.shape(),
        symmetry_ops = grid.operations.len(),
        "accumulating event set"
    );

    let data = bin_pass(events, &grid, normalization, None);

    let background = match background {
        None => None,
        Some(bkg) => {
            bkg.validate()?;
            if bkg.frame == Frame::Sample {
                return Err(SliceError::config(format!(
                    "sample-frame background '{}' must be accumulated separately from '{}'",
                    bkg.name, events.name
                )));
            }
            if bkg.dimensions.len() != events.dimensions.len()
                || bkg.dimensions.iter().zip(&events.dimensions).any(|(a, b)| a.name != b.name || a.kind != b.kind)
            {
                return Err(SliceError::config(format!(
                    "background '{}' does not have the dimensions of '{}'",
                    bkg.name, events.name
                )));
            }

            let rotations: Vec<Matrix3<f64>> = match events.frame {
                Frame::Sample => events.runs.iter().map(|r| r.goniometer_matrix().transpose()).collect(),
                Frame::Lab => vec![Matrix3::identity()],
            };
            debug!(name = %bkg.name, orientations = rotations.len(), "accumulating lab-frame background jointly");

            let axes = grid.histogram_axes();
            let pair = rotations
                .par_iter()
                .map(|rotation| bin_pass(bkg, &grid, normalization, Some(rotation)))
                .reduce(|| BinnedPair::zeros(axes.clone()), |mut a, b| {
                    a.merge(&b);
                    a
                });
            Some(pair)
        }
    };

    Ok(Accumulation { data, background })
}

fn bin_pass(
    events: &EventSet,
    grid: &BinGrid,
    normalization: &NormalizationSource,
    rotation: Option<&Matrix3<f64>>,
) -> BinnedPair {
    let axes = grid.histogram_axes();

    let data = (0..events.n_events())
        .into_par_iter()
        .fold(
            || Histogram::zeros(axes.clone()),
            |mut hist, i| {
                let coords = events.event_coords(i);
                for op in &grid.operations {
                    let point = grid.project(coords, op, rotation);
                    if let Some(index) = grid.index_of(&point) {
                        hist.signal[index] += events.signal[i];
                        hist.error_sq[index] += events.error_sq[i];
                        hist.events[index] += 1;
                    }
                }
                hist
            },
        )
        .reduce(|| Histogram::zeros(axes.clone()), |mut a, b| {
            a.merge(&b);
            a
        });

    let n_dims = events.n_dims();
    let core = events.n_core_dims();
    let norm = events
        .trajectories
        .par_iter()
        .fold(
            || Histogram::zeros(axes.clone()),
            |mut hist, trajectory| {
                let run = &events.runs[trajectory.run as usize];
                let weight = trajectory.flux * normalization.factor(trajectory.detector) * run.charge;
                if weight == 0.0 {
                    return hist;
                }

                // extra coordinates of a trajectory come from its run's logs;
                // a missing log leaves the trajectory unconstrained along that axis
                let mut start = vec![f64::NAN; n_dims];
                let mut end = vec![f64::NAN; n_dims];
                start[..core].copy_from_slice(&trajectory.start);
                end[..core].copy_from_slice(&trajectory.end);
                for d in core..n_dims {
                    if let Some(v) = run.log(&events.dimensions[d].name) {
                        start[d] = v;
                        end[d] = v;
                    }
                }

                for op in &grid.operations {
                    let a = grid.project(&start, op, rotation);
                    let b = grid.project(&end, op, rotation);
                    deposit_segment(grid, &a, &b, weight, &mut hist.signal);
                }
                hist
            },
        )
        .reduce(|| Histogram::zeros(axes.clone()), |mut a, b| {
            a.merge(&b);
            a
        });

    BinnedPair::new(data, norm)
}

/// Spreads `weight` over the bins crossed by the segment `a → b`, in
/// proportion to the parameter length inside each bin.
fn deposit_segment(grid: &BinGrid, a: &[f64], b: &[f64], weight: f64, norm: &mut [f64]) {
    let free: Vec<usize> = (0..grid.axes.len()).filter(|&d| a[d].is_nan() || b[d].is_nan()).collect();

    let mut breaks = vec![0.0, 1.0];
    let mut degenerate = true;
    for (d, axis) in grid.axes.iter().enumerate() {
        if free.contains(&d) || a[d] == b[d] {
            continue;
        }
        degenerate = false;
        for &edge in &axis.edges {
            let t = (edge - a[d]) / (b[d] - a[d]);
            if t > 0.0 && t < 1.0 {
                breaks.push(t);
            }
        }
    }

    if degenerate {
        deposit_point(grid, a, &free, weight, norm);
        return;
    }

    breaks.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    breaks.dedup();

    let mut point = a.to_vec();
    for w in breaks.windows(2) {
        let dt = w[1] - w[0];
        if dt <= 0.0 {
            continue;
        }
        let mid = 0.5 * (w[0] + w[1]);
        for d in 0..point.len() {
            if !free.contains(&d) {
                point[d] = a[d] + mid * (b[d] - a[d]);
            }
        }
        deposit_point(grid, &point, &free, weight * dt, norm);
    }
}

fn deposit_point(grid: &BinGrid, point: &[f64], free: &[usize], weight: f64, norm: &mut [f64]) {
    let strides = grid.strides();
    let mut base = 0;
    for (d, axis) in grid.axes.iter().enumerate() {
        if free.contains(&d) {
            continue;
        }
        match axis.locate(point[d]) {
            Some(i) => base += i * strides[d],
            None => return,
        }
    }

    let mut indices = vec![base];
    for &d in free {
        indices = indices
            .iter()
            .flat_map(|&i| (0..grid.axes[d].n_bins()).map(move |k| i + k * strides[d]))
            .collect();
    }
    for i in indices {
        norm[i] += weight;
    }
}
