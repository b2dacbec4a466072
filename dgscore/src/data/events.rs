use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use bincode::{Decode, Encode};
use nalgebra::Matrix3;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SliceError};

/// Coordinate frame of the momentum-transfer axes of an event set.
///
/// `Lab` coordinates are fixed to the instrument and do not depend on the
/// goniometer angle, `Sample` coordinates rotate with the sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum Frame {
    Lab,
    Sample,
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Lab => write!(f, "Lab"),
            Frame::Sample => write!(f, "Sample"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum DimensionKind {
    Momentum,
    Energy,
    Extra,
}

/// A named coordinate of the event set together with its declared extent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Dimension {
    pub name: String,
    pub kind: DimensionKind,
    pub min: f64,
    pub max: f64,
}

impl Dimension {
    pub fn new(name: &str, kind: DimensionKind, min: f64, max: f64) -> Self {
        Dimension { name: name.to_string(), kind, min, max }
    }

    pub fn momentum(name: &str, min: f64, max: f64) -> Self {
        Dimension::new(name, DimensionKind::Momentum, min, max)
    }

    pub fn energy(name: &str, min: f64, max: f64) -> Self {
        Dimension::new(name, DimensionKind::Energy, min, max)
    }

    pub fn extra(name: &str, min: f64, max: f64) -> Self {
        Dimension::new(name, DimensionKind::Extra, min, max)
    }
}

/// Per-run metadata: goniometer rotation (sample to lab), integrated charge
/// used to scale the normalization, and scalar sample logs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RunInfo {
    pub goniometer: [[f64; 3]; 3],
    pub charge: f64,
    pub logs: BTreeMap<String, f64>,
}

impl Default for RunInfo {
    fn default() -> Self {
        RunInfo {
            goniometer: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            charge: 1.0,
            logs: BTreeMap::new(),
        }
    }
}

impl RunInfo {
    pub fn with_log(mut self, name: &str, value: f64) -> Self {
        self.logs.insert(name.to_string(), value);
        self
    }

    pub fn with_charge(mut self, charge: f64) -> Self {
        self.charge = charge;
        self
    }

    /// Goniometer rotation about the vertical (`y`) axis by `angle_deg`.
    pub fn with_rotation_y(mut self, angle_deg: f64) -> Self {
        let (s, c) = angle_deg.to_radians().sin_cos();
        self.goniometer = [[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]];
        self
    }

    pub fn goniometer_matrix(&self) -> Matrix3<f64> {
        let g = &self.goniometer;
        Matrix3::new(
            g[0][0], g[0][1], g[0][2],
            g[1][0], g[1][1], g[1][2],
            g[2][0], g[2][1], g[2][2],
        )
    }

    pub fn log(&self, name: &str) -> Option<f64> {
        self.logs.get(name).copied()
    }
}

/// Coverage of one detector during one run: a straight segment through the
/// momentum/energy coordinates swept by the detector, with the flux it saw.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Trajectory {
    pub run: u32,
    pub detector: u32,
    pub start: Vec<f64>,
    pub end: Vec<f64>,
    pub flux: f64,
}

impl Trajectory {
    pub fn new(run: u32, detector: u32, start: Vec<f64>, end: Vec<f64>, flux: f64) -> Self {
        Trajectory { run, detector, start, end, flux }
    }
}

/// Multidimensional event set (MDE), stored struct-of-arrays.
///
/// `coords` is row-major with one row of `dimensions.len()` values per event.
/// The first three dimensions are momentum transfer, an optional energy
/// transfer follows, extra named dimensions come last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct EventSet {
    pub name: String,
    pub frame: Frame,
    pub dimensions: Vec<Dimension>,
    pub coords: Vec<f64>,
    pub signal: Vec<f64>,
    pub error_sq: Vec<f64>,
    pub run: Vec<u32>,
    pub detector: Vec<u32>,
    pub runs: Vec<RunInfo>,
    pub trajectories: Vec<Trajectory>,
}

impl EventSet {
    /// Creates an empty event set.
    ///
    /// # Arguments
    ///
    /// * `name` - name used to refer to the set in errors and in the artifact store.
    /// * `frame` - coordinate frame of the momentum axes.
    /// * `dimensions` - three momentum dimensions, an optional energy dimension, then extras.
    ///
    /// # Examples
    ///
    /// ```
    /// use dgscore::data::events::{Dimension, EventSet, Frame, RunInfo};
    ///
    /// let mut events = EventSet::new("sample", Frame::Sample, vec![
    ///     Dimension::momentum("H", -2.0, 2.0),
    ///     Dimension::momentum("K", -2.0, 2.0),
    ///     Dimension::momentum("L", -2.0, 2.0),
    ///     Dimension::energy("DeltaE", -5.0, 20.0),
    /// ]);
    /// let run = events.add_run(RunInfo::default().with_log("temperature", 5.0));
    /// events.push_event(&[0.5, 0.0, 0.0, 1.0], 3.0, 3.0, run, 17);
    /// assert_eq!(events.n_events(), 1);
    /// ```
    pub fn new(name: &str, frame: Frame, dimensions: Vec<Dimension>) -> Self {
        EventSet {
            name: name.to_string(),
            frame,
            dimensions,
            coords: Vec::new(),
            signal: Vec::new(),
            error_sq: Vec::new(),
            run: Vec::new(),
            detector: Vec::new(),
            runs: Vec::new(),
            trajectories: Vec::new(),
        }
    }

    pub fn add_run(&mut self, run: RunInfo) -> u32 {
        self.runs.push(run);
        (self.runs.len() - 1) as u32
    }

    pub fn push_event(&mut self, coords: &[f64], signal: f64, error_sq: f64, run: u32, detector: u32) {
        assert_eq!(coords.len(), self.dimensions.len(), "event coordinate count must match dimensions");
        self.coords.extend_from_slice(coords);
        self.signal.push(signal);
        self.error_sq.push(error_sq);
        self.run.push(run);
        self.detector.push(detector);
    }

    pub fn add_trajectory(&mut self, trajectory: Trajectory) {
        self.trajectories.push(trajectory);
    }

    pub fn n_events(&self) -> usize {
        self.signal.len()
    }

    pub fn n_dims(&self) -> usize {
        self.dimensions.len()
    }

    /// Momentum plus energy dimensions, i.e. everything that is not an extra dimension.
    pub fn n_core_dims(&self) -> usize {
        self.dimensions.iter().filter(|d| d.kind != DimensionKind::Extra).count()
    }

    pub fn energy_index(&self) -> Option<usize> {
        self.dimensions.iter().position(|d| d.kind == DimensionKind::Energy)
    }

    pub fn dimension_index(&self, name: &str) -> Option<usize> {
        self.dimensions.iter().position(|d| d.name == name)
    }

    pub fn event_coords(&self, event: usize) -> &[f64] {
        let n = self.n_dims();
        &self.coords[event * n..(event + 1) * n]
    }

    pub fn run_info(&self, event: usize) -> &RunInfo {
        &self.runs[self.run[event] as usize]
    }

    /// Value of a named variable for one event: an extra coordinate of that
    /// name if present, otherwise the sample log of the event's run.
    pub fn variable(&self, event: usize, name: &str) -> Option<f64> {
        match self.dimension_index(name) {
            Some(d) if self.dimensions[d].kind == DimensionKind::Extra => Some(self.event_coords(event)[d]),
            _ => self.run_info(event).log(name),
        }
    }

    /// True if every event can resolve `name` through [`EventSet::variable`].
    pub fn has_variable(&self, name: &str) -> bool {
        let is_extra = self
            .dimension_index(name)
            .map(|d| self.dimensions[d].kind == DimensionKind::Extra)
            .unwrap_or(false);
        is_extra || (!self.runs.is_empty() && self.runs.iter().all(|r| r.logs.contains_key(name)))
    }

    /// Checks the structural invariants of the set.
    pub fn validate(&self) -> Result<()> {
        let kinds: Vec<DimensionKind> = self.dimensions.iter().map(|d| d.kind).collect();
        let momentum = kinds.iter().take_while(|k| **k == DimensionKind::Momentum).count();
        if momentum != 3 || kinds.iter().filter(|k| **k == DimensionKind::Momentum).count() != 3 {
            return Err(SliceError::config(format!(
                "event set '{}' must start with exactly three momentum dimensions",
                self.name
            )));
        }
        let energy = kinds.iter().filter(|k| **k == DimensionKind::Energy).count();
        if energy > 1 || (energy == 1 && kinds[3] != DimensionKind::Energy) {
            return Err(SliceError::config(format!(
                "event set '{}' may have one energy dimension, directly after the momentum dimensions",
                self.name
            )));
        }

        let n = self.n_events();
        if self.coords.len() != n * self.n_dims()
            || self.error_sq.len() != n
            || self.run.len() != n
            || self.detector.len() != n
        {
            return Err(SliceError::config(format!("event set '{}' has inconsistent array lengths", self.name)));
        }
        if n == 0 {
            return Err(SliceError::config(format!("event set '{}' is empty", self.name)));
        }
        if self.run.iter().any(|&r| r as usize >= self.runs.len())
            || self.trajectories.iter().any(|t| t.run as usize >= self.runs.len())
        {
            return Err(SliceError::config(format!("event set '{}' references an unknown run", self.name)));
        }
        let core = self.n_core_dims();
        if self.trajectories.iter().any(|t| t.start.len() != core || t.end.len() != core) {
            return Err(SliceError::config(format!(
                "event set '{}' has trajectories that do not span its {} momentum/energy dimensions",
                self.name, core
            )));
        }
        Ok(())
    }

    /// Returns a copy with every event's signal multiplied by `factors[i]`
    /// and its squared error by `factors[i]²`. Trajectories are kept as is.
    pub fn scaled_by(&self, name: &str, factors: &[f64]) -> EventSet {
        assert_eq!(factors.len(), self.n_events());
        let mut scaled = self.clone();
        scaled.name = name.to_string();
        for (i, f) in factors.iter().enumerate() {
            scaled.signal[i] *= f;
            scaled.error_sq[i] *= f * f;
        }
        scaled
    }

    pub fn total_signal(&self) -> f64 {
        self.signal.iter().sum()
    }

    /// Hash of everything but the name: frame, dimensions, events, runs and
    /// trajectories. Two sets with the same hash bin identically.
    pub fn content_hash(&self) -> u64 {
        fn floats(values: &[f64], hasher: &mut FxHasher) {
            values.len().hash(hasher);
            for v in values {
                v.to_bits().hash(hasher);
            }
        }

        let mut hasher = FxHasher::default();
        (self.frame == Frame::Lab).hash(&mut hasher);
        for d in &self.dimensions {
            d.name.hash(&mut hasher);
            floats(&[d.min, d.max], &mut hasher);
        }
        floats(&self.coords, &mut hasher);
        floats(&self.signal, &mut hasher);
        floats(&self.error_sq, &mut hasher);
        self.run.hash(&mut hasher);
        self.detector.hash(&mut hasher);
        for r in &self.runs {
            floats(&r.goniometer.concat(), &mut hasher);
            r.charge.to_bits().hash(&mut hasher);
            for (name, value) in &r.logs {
                name.hash(&mut hasher);
                value.to_bits().hash(&mut hasher);
            }
        }
        for t in &self.trajectories {
            (t.run, t.detector).hash(&mut hasher);
            floats(&t.start, &mut hasher);
            floats(&t.end, &mut hasher);
            t.flux.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl Display for EventSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let dims: Vec<&str> = self.dimensions.iter().map(|d| d.name.as_str()).collect();
        write!(
            f,
            "EventSet(name: {}, frame: {}, dimensions: [{}], events: {}, runs: {}, trajectories: {})",
            self.name,
            self.frame,
            dims.join(", "),
            self.n_events(),
            self.runs.len(),
            self.trajectories.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qe_dims() -> Vec<Dimension> {
        vec![
            Dimension::momentum("H", -1.0, 1.0),
            Dimension::momentum("K", -1.0, 1.0),
            Dimension::momentum("L", -1.0, 1.0),
            Dimension::energy("DeltaE", 0.0, 10.0),
            Dimension::extra("temperature", 0.0, 300.0),
        ]
    }

    #[test]
    fn test_validate_rejects_empty_set() {
        let events = EventSet::new("empty", Frame::Lab, qe_dims());
        let err = events.validate().unwrap_err();
        assert!(matches!(err, SliceError::Configuration(_)));
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_validate_requires_three_momentum_dims() {
        let mut events = EventSet::new(
            "short",
            Frame::Lab,
            vec![Dimension::momentum("H", -1.0, 1.0), Dimension::energy("DeltaE", 0.0, 1.0)],
        );
        let run = events.add_run(RunInfo::default());
        events.push_event(&[0.0, 0.5], 1.0, 1.0, run, 0);
        assert!(events.validate().is_err());
    }

    #[test]
    fn test_variable_prefers_extra_dimension() {
        let mut events = EventSet::new("vars", Frame::Sample, qe_dims());
        let run = events.add_run(RunInfo::default().with_log("temperature", 10.0).with_log("Ei", 25.0));
        events.push_event(&[0.0, 0.0, 0.0, 1.0, 42.0], 1.0, 1.0, run, 0);

        assert_eq!(events.variable(0, "temperature"), Some(42.0));
        assert_eq!(events.variable(0, "Ei"), Some(25.0));
        assert_eq!(events.variable(0, "psi"), None);
        assert!(events.has_variable("Ei"));
        assert!(!events.has_variable("psi"));
    }

    #[test]
    fn test_scaled_by_squares_error_factor() {
        let mut events = EventSet::new("scaled", Frame::Lab, qe_dims());
        let run = events.add_run(RunInfo::default());
        events.push_event(&[0.0, 0.0, 0.0, 1.0, 5.0], 2.0, 4.0, run, 0);
        let scaled = events.scaled_by("scaled_F", &[3.0]);
        assert_eq!(scaled.name, "scaled_F");
        assert_eq!(scaled.signal[0], 6.0);
        assert_eq!(scaled.error_sq[0], 36.0);
        assert_eq!(events.signal[0], 2.0);
    }

    #[test]
    fn test_content_hash_ignores_name_only() {
        let mut events = EventSet::new("a", Frame::Sample, qe_dims());
        let run = events.add_run(RunInfo::default());
        events.push_event(&[0.0, 0.0, 0.0, 1.0, 5.0], 1.0, 1.0, run, 0);

        let mut renamed = events.clone();
        renamed.name = "b".to_string();
        assert_eq!(events.content_hash(), renamed.content_hash());

        let rescaled = events.scaled_by("a", &[5.0]);
        assert_ne!(events.content_hash(), rescaled.content_hash());

        let mut rotated = events.clone();
        rotated.runs[0] = RunInfo::default().with_rotation_y(10.0);
        assert_ne!(events.content_hash(), rotated.content_hash());
    }

    #[test]
    fn test_rotation_is_orthonormal() {
        let run = RunInfo::default().with_rotation_y(30.0);
        let g = run.goniometer_matrix();
        let should_be_identity = g.transpose() * g;
        assert!((should_be_identity - Matrix3::identity()).norm() < 1e-12);
    }
}
