use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use itertools::Itertools;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::algorithm::symmetry::SymmetryOperation;
use crate::data::events::{DimensionKind, EventSet};
use crate::data::histogram::Axis;
use crate::error::{Result, SliceError};

/// Range of one binned dimension, written as `"min,step,max"`, `"min,max"`
/// or `""` in the range mini-language.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum BinRange {
    Regular { min: f64, step: f64, max: f64 },
    Integrated { min: f64, max: f64 },
    Auto,
}

impl BinRange {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(BinRange::Auto);
        }
        let values: Vec<f64> = text
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| SliceError::config(format!("invalid binning range '{}'", text)))?;

        let range = match values.as_slice() {
            [min, step, max] => BinRange::Regular { min: *min, step: *step, max: *max },
            [min, max] => BinRange::Integrated { min: *min, max: *max },
            _ => {
                return Err(SliceError::config(format!(
                    "binning range '{}' must be 'min,step,max', 'min,max' or empty",
                    text
                )))
            }
        };
        range.check()?;
        Ok(range)
    }

    fn check(&self) -> Result<()> {
        match *self {
            BinRange::Regular { min, step, max } => {
                if !(step > 0.0) || !(max > min) || !min.is_finite() || !max.is_finite() {
                    return Err(SliceError::config(format!(
                        "regular binning needs min < max and a positive step, got {},{},{}",
                        min, step, max
                    )));
                }
            }
            BinRange::Integrated { min, max } => {
                if !(max >= min) || !min.is_finite() || !max.is_finite() {
                    return Err(SliceError::config(format!(
                        "integration range needs min <= max, got {},{}",
                        min, max
                    )));
                }
            }
            BinRange::Auto => {}
        }
        Ok(())
    }

    /// Bin edges; `extent` is used for the automatic range.
    pub fn edges(&self, extent: (f64, f64)) -> Vec<f64> {
        match *self {
            BinRange::Regular { min, step, max } => {
                let n = (((max - min) / step) - 1e-9).ceil().max(1.0) as usize;
                (0..=n).map(|i| min + i as f64 * step).collect()
            }
            BinRange::Integrated { min, max } => vec![min, max],
            BinRange::Auto => vec![extent.0, extent.1],
        }
    }
}

impl FromStr for BinRange {
    type Err = SliceError;

    fn from_str(s: &str) -> Result<Self> {
        BinRange::parse(s)
    }
}

impl Display for BinRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BinRange::Regular { min, step, max } => write!(f, "{},{},{}", min, step, max),
            BinRange::Integrated { min, max } => write!(f, "{},{}", min, max),
            BinRange::Auto => write!(f, ""),
        }
    }
}

/// Parses a projection vector such as `"1,1,0"`.
pub fn parse_projection(text: &str) -> Result<[f64; 3]> {
    let values: Vec<f64> = text
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| SliceError::config(format!("invalid projection vector '{}'", text)))?;
    match values.as_slice() {
        [a, b, c] => Ok([*a, *b, *c]),
        _ => Err(SliceError::config(format!("projection vector '{}' must have three components", text))),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DimensionBinning {
    pub name: String,
    pub projection: Option<[f64; 3]>,
    pub range: BinRange,
}

impl DimensionBinning {
    pub fn new(name: &str, projection: Option<[f64; 3]>, range: BinRange) -> Self {
        DimensionBinning { name: name.to_string(), projection, range }
    }

    /// Builds a descriptor from its textual form.
    ///
    /// # Examples
    ///
    /// ```
    /// use dgscore::data::binning::{BinRange, DimensionBinning};
    ///
    /// let dim = DimensionBinning::parse("[H,H,0]", Some("1,1,0"), "-1,0.1,1").unwrap();
    /// assert_eq!(dim.projection, Some([1.0, 1.0, 0.0]));
    /// assert!(matches!(dim.range, BinRange::Regular { .. }));
    /// ```
    pub fn parse(name: &str, projection: Option<&str>, range: &str) -> Result<Self> {
        let projection = match projection {
            Some(p) if !p.trim().is_empty() => Some(parse_projection(p)?),
            _ => None,
        };
        Ok(DimensionBinning::new(name, projection, BinRange::parse(range)?))
    }
}

/// Ordered per-dimension binning plus the symmetry operations used to fold
/// equivalent orientations before division.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BinningSpec {
    pub dimensions: Vec<DimensionBinning>,
    pub symmetry: Vec<SymmetryOperation>,
}

impl BinningSpec {
    pub fn new(dimensions: Vec<DimensionBinning>) -> Self {
        BinningSpec { dimensions, symmetry: Vec::new() }
    }

    pub fn with_symmetry(mut self, symmetry: Vec<SymmetryOperation>) -> Self {
        self.symmetry = symmetry;
        self
    }

    pub fn with_symmetry_str(self, text: &str) -> Result<Self> {
        Ok(self.with_symmetry(SymmetryOperation::parse_list(text)?))
    }

    /// Copy with every automatic range replaced by the extent it resolves to
    /// for `events`, so that other event sets bin onto the same grid.
    pub fn pinned_to(&self, events: &EventSet) -> Result<BinningSpec> {
        if !self.dimensions.iter().any(|d| d.range == BinRange::Auto) {
            return Ok(self.clone());
        }
        events.validate()?;
        let grid = BinGrid::resolve(self, events)?;
        let dimensions = self
            .dimensions
            .iter()
            .zip(&grid.axes)
            .map(|(d, axis)| match d.range {
                BinRange::Auto => {
                    let range = BinRange::Integrated { min: axis.edges[0], max: axis.edges[axis.n_bins()] };
                    DimensionBinning::new(&d.name, d.projection, range)
                }
                _ => d.clone(),
            })
            .collect();
        Ok(BinningSpec { dimensions, symmetry: self.symmetry.clone() })
    }

    /// Stable textual key of the binning, used to name cached artifacts.
    pub fn fingerprint(&self) -> String {
        let dims = self
            .dimensions
            .iter()
            .map(|d| match d.projection {
                Some(p) => format!("{}[{},{},{}]({})", d.name, p[0], p[1], p[2], d.range),
                None => format!("{}({})", d.name, d.range),
            })
            .join("|");
        let ops = self.symmetry.iter().map(|s| s.identifier.as_str()).join(";");
        let mut hasher = rustc_hash::FxHasher::default();
        std::hash::Hash::hash(&format!("{}#{}", dims, ops), &mut hasher);
        format!("{:016x}", std::hash::Hasher::finish(&hasher))
    }
}

/// Where an output axis takes its coordinate from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AxisSource {
    /// Row of `W⁻¹ · Q`.
    Momentum(usize),
    /// Index into the event coordinates (energy or extra dimension).
    Coordinate(usize),
}

#[derive(Clone, Debug)]
pub struct GridAxis {
    pub name: String,
    pub source: AxisSource,
    pub edges: Vec<f64>,
}

impl GridAxis {
    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    /// Bin containing `x`; bins are `[lo, hi)` except the last, which includes its top edge.
    pub fn locate(&self, x: f64) -> Option<usize> {
        let lo = self.edges[0];
        let hi = self.edges[self.edges.len() - 1];
        if x.is_nan() || x < lo || x > hi {
            return None;
        }
        if x == hi {
            return Some(self.n_bins() - 1);
        }
        Some(self.edges.partition_point(|&e| e <= x) - 1)
    }
}

/// A binning specification resolved against a concrete event set: bin edges,
/// inverse projection matrix and symmetry matrices ready for accumulation.
#[derive(Clone, Debug)]
pub struct BinGrid {
    pub axes: Vec<GridAxis>,
    pub w_inv: Matrix3<f64>,
    pub operations: Vec<Matrix3<f64>>,
    strides: Vec<usize>,
}

impl BinGrid {
    pub fn resolve(spec: &BinningSpec, events: &EventSet) -> Result<Self> {
        let momentum: Vec<&DimensionBinning> = spec.dimensions.iter().filter(|d| d.projection.is_some()).collect();
        let mut non_extra = momentum.len();
        for d in spec.dimensions.iter().filter(|d| d.projection.is_none()) {
            match events.dimension_index(&d.name).map(|i| events.dimensions[i].kind) {
                Some(DimensionKind::Energy) => non_extra += 1,
                Some(DimensionKind::Extra) => {}
                _ => {
                    return Err(SliceError::config(format!(
                        "binning dimension '{}' has no projection and does not name an energy or extra dimension of '{}'",
                        d.name, events.name
                    )))
                }
            }
        }
        if momentum.len() != 3 || non_extra != events.n_core_dims() {
            return Err(SliceError::config(format!(
                "binning specifies {} momentum/energy dimensions ({} projected) but '{}' has {}",
                non_extra,
                momentum.len(),
                events.name,
                events.n_core_dims()
            )));
        }

        let columns: Vec<Vector3<f64>> = momentum
            .iter()
            .filter_map(|d| d.projection.map(|p| Vector3::new(p[0], p[1], p[2])))
            .collect();
        let w = Matrix3::from_columns(&columns);
        let w_inv = w
            .try_inverse()
            .ok_or_else(|| SliceError::config("projection vectors are linearly dependent"))?;

        let operations: Vec<Matrix3<f64>> = if spec.symmetry.is_empty() {
            vec![Matrix3::identity()]
        } else {
            spec.symmetry.iter().map(|s| s.matrix()).collect()
        };

        let mut axes = Vec::with_capacity(spec.dimensions.len());
        let mut momentum_row = 0;
        for d in &spec.dimensions {
            let source = match d.projection {
                Some(_) => {
                    momentum_row += 1;
                    AxisSource::Momentum(momentum_row - 1)
                }
                None => AxisSource::Coordinate(events.dimension_index(&d.name).unwrap_or(0)),
            };
            let extent = match source {
                AxisSource::Momentum(row) => momentum_extent(events, &w_inv, &operations, row),
                AxisSource::Coordinate(i) => (events.dimensions[i].min, events.dimensions[i].max),
            };
            axes.push(GridAxis { name: d.name.clone(), source, edges: d.range.edges(extent) });
        }

        let mut strides = Vec::with_capacity(axes.len());
        let mut stride = 1;
        for axis in &axes {
            strides.push(stride);
            stride *= axis.n_bins();
        }

        Ok(BinGrid { axes, w_inv, operations, strides })
    }

    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.n_bins()).collect()
    }

    pub fn n_bins(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn histogram_axes(&self) -> Vec<Axis> {
        self.axes.iter().map(|a| Axis::new(&a.name, a.edges.clone())).collect()
    }

    /// Output-axis coordinates of a point given in event coordinates. The
    /// momentum part is first rotated (if `rotation` is given), then folded
    /// by `operation`, then projected.
    pub fn project(&self, coords: &[f64], operation: &Matrix3<f64>, rotation: Option<&Matrix3<f64>>) -> Vec<f64> {
        let mut q = Vector3::new(coords[0], coords[1], coords[2]);
        if let Some(r) = rotation {
            q = r * q;
        }
        let p = self.w_inv * (operation * q);
        self.axes
            .iter()
            .map(|a| match a.source {
                AxisSource::Momentum(row) => p[row],
                AxisSource::Coordinate(i) => coords.get(i).copied().unwrap_or(f64::NAN),
            })
            .collect()
    }

    /// Flat (dimension-0-fastest) index of the bin holding `point`.
    pub fn index_of(&self, point: &[f64]) -> Option<usize> {
        let mut index = 0;
        for ((axis, stride), &x) in self.axes.iter().zip(&self.strides).zip(point) {
            index += axis.locate(x)? * stride;
        }
        Some(index)
    }
}

/// Projected extent of the event set's declared momentum box along `row`,
/// taken over every box corner and every symmetry operation.
fn momentum_extent(events: &EventSet, w_inv: &Matrix3<f64>, operations: &[Matrix3<f64>], row: usize) -> (f64, f64) {
    let bounds: Vec<(f64, f64)> = events.dimensions.iter().take(3).map(|d| (d.min, d.max)).collect();
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for corner in (0..3).map(|i| [bounds[i].0, bounds[i].1]).multi_cartesian_product() {
        let q = Vector3::new(corner[0], corner[1], corner[2]);
        for op in operations {
            let p = w_inv * (op * q);
            lo = lo.min(p[row]);
            hi = hi.max(p[row]);
        }
    }
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::events::{Dimension, Frame, RunInfo};

    fn events_4d() -> EventSet {
        let mut events = EventSet::new(
            "grid",
            Frame::Sample,
            vec![
                Dimension::momentum("H", -2.0, 2.0),
                Dimension::momentum("K", -1.0, 1.0),
                Dimension::momentum("L", -1.0, 1.0),
                Dimension::energy("DeltaE", -1.0, 9.0),
            ],
        );
        let run = events.add_run(RunInfo::default());
        events.push_event(&[0.5, 0.0, 0.0, 2.0], 1.0, 1.0, run, 0);
        events
    }

    fn hkle(h: &str, k: &str, l: &str, e: &str) -> BinningSpec {
        BinningSpec::new(vec![
            DimensionBinning::parse("H", Some("1,0,0"), h).unwrap(),
            DimensionBinning::parse("K", Some("0,1,0"), k).unwrap(),
            DimensionBinning::parse("L", Some("0,0,1"), l).unwrap(),
            DimensionBinning::parse("DeltaE", None, e).unwrap(),
        ])
    }

    #[test]
    fn test_parse_ranges() {
        assert_eq!(BinRange::parse(" ").unwrap(), BinRange::Auto);
        assert_eq!(BinRange::parse("0,1").unwrap(), BinRange::Integrated { min: 0.0, max: 1.0 });
        assert_eq!(
            BinRange::parse("0, 0.5, 2").unwrap(),
            BinRange::Regular { min: 0.0, step: 0.5, max: 2.0 }
        );
        assert!(BinRange::parse("0,1,2,3").is_err());
        assert!(BinRange::parse("a,b").is_err());
        assert!(BinRange::parse("1,0,2").is_err());
        assert!(BinRange::parse("2,0.1,1").is_err());
    }

    #[test]
    fn test_regular_edges() {
        let edges = BinRange::parse("0,0.25,1").unwrap().edges((0.0, 0.0));
        assert_eq!(edges, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        // a step that does not divide the range still covers max
        let edges = BinRange::parse("0,0.3,1").unwrap().edges((0.0, 0.0));
        assert_eq!(edges.len(), 5);
        assert!(edges[4] >= 1.0);
    }

    #[test]
    fn test_resolve_auto_extent_and_shape() {
        let events = events_4d();
        let grid = BinGrid::resolve(&hkle("-2,0.5,2", "", "-0.1,0.1", "0,1,8"), &events).unwrap();
        assert_eq!(grid.shape(), vec![8, 1, 1, 8]);
        assert_eq!(grid.axes[1].edges, vec![-1.0, 1.0]);
        assert_eq!(grid.strides(), &[1, 8, 8, 8]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let events = events_4d();
        let spec = BinningSpec::new(vec![
            DimensionBinning::parse("H", Some("1,0,0"), "").unwrap(),
            DimensionBinning::parse("K", Some("0,1,0"), "").unwrap(),
            DimensionBinning::parse("L", Some("0,0,1"), "").unwrap(),
        ]);
        let err = BinGrid::resolve(&spec, &events).unwrap_err();
        assert!(matches!(err, SliceError::Configuration(_)));
    }

    #[test]
    fn test_singular_projection() {
        let events = events_4d();
        let spec = BinningSpec::new(vec![
            DimensionBinning::parse("H", Some("1,0,0"), "").unwrap(),
            DimensionBinning::parse("H2", Some("2,0,0"), "").unwrap(),
            DimensionBinning::parse("L", Some("0,0,1"), "").unwrap(),
            DimensionBinning::parse("DeltaE", None, "").unwrap(),
        ]);
        assert!(BinGrid::resolve(&spec, &events).is_err());
    }

    #[test]
    fn test_locate_and_index() {
        let events = events_4d();
        let grid = BinGrid::resolve(&hkle("0,0.5,2", "-1,1", "-1,1", "0,10"), &events).unwrap();
        let axis = &grid.axes[0];
        assert_eq!(axis.locate(0.0), Some(0));
        assert_eq!(axis.locate(0.5), Some(1));
        assert_eq!(axis.locate(2.0), Some(3));
        assert_eq!(axis.locate(2.0001), None);
        assert_eq!(axis.locate(-0.1), None);

        let p = grid.project(&[1.2, 0.0, 0.0, 3.0], &Matrix3::identity(), None);
        assert_eq!(grid.index_of(&p), Some(2));
    }

    #[test]
    fn test_projection_along_hh0() {
        let events = events_4d();
        let spec = BinningSpec::new(vec![
            DimensionBinning::parse("[H,H,0]", Some("1,1,0"), "-1,1").unwrap(),
            DimensionBinning::parse("[H,-H,0]", Some("1,-1,0"), "-1,1").unwrap(),
            DimensionBinning::parse("L", Some("0,0,1"), "-1,1").unwrap(),
            DimensionBinning::parse("DeltaE", None, "0,10").unwrap(),
        ]);
        let grid = BinGrid::resolve(&spec, &events).unwrap();
        let p = grid.project(&[1.0, 1.0, 0.0, 1.0], &Matrix3::identity(), None);
        assert!((p[0] - 1.0).abs() < 1e-12);
        assert!(p[1].abs() < 1e-12);
    }

    #[test]
    fn test_pinned_to_fixes_auto_ranges() {
        let events = events_4d();
        let spec = hkle("-2,0.5,2", "", "-0.1,0.1", "");
        let pinned = spec.pinned_to(&events).unwrap();
        assert_eq!(pinned.dimensions[0].range, spec.dimensions[0].range);
        assert_eq!(pinned.dimensions[1].range, BinRange::Integrated { min: -1.0, max: 1.0 });
        assert_eq!(pinned.dimensions[3].range, BinRange::Integrated { min: -1.0, max: 9.0 });

        // a set with a wider declared box still lands on the pinned grid
        let mut wide = events_4d();
        wide.dimensions[1] = Dimension::momentum("K", -4.0, 4.0);
        let grid = BinGrid::resolve(&pinned, &wide).unwrap();
        assert_eq!(grid.axes[1].edges, vec![-1.0, 1.0]);
        assert_eq!(BinGrid::resolve(&spec, &wide).unwrap().axes[1].edges, vec![-4.0, 4.0]);

        let explicit = hkle("-2,0.5,2", "-1,1", "-1,1", "0,10");
        assert_eq!(explicit.pinned_to(&wide).unwrap(), explicit);
    }

    #[test]
    fn test_fingerprint_changes_with_symmetry() {
        let spec = hkle("0,0.5,2", "", "", "");
        let folded = spec.clone().with_symmetry_str("-x,-y,-z").unwrap();
        assert_eq!(spec.fingerprint(), hkle("0,0.5,2", "", "", "").fingerprint());
        assert_ne!(spec.fingerprint(), folded.fingerprint());
    }
}
