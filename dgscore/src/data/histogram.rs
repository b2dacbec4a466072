use std::fmt;
use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SliceError};

/// One histogram dimension: its name and `n_bins + 1` bin boundaries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Axis {
    pub name: String,
    pub edges: Vec<f64>,
}

impl Axis {
    pub fn new(name: &str, edges: Vec<f64>) -> Self {
        Axis { name: name.to_string(), edges }
    }

    pub fn n_bins(&self) -> usize {
        self.edges.len().saturating_sub(1)
    }

    pub fn centers(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }
}

/// Dense multidimensional histogram (MDH).
///
/// Arrays are flattened with dimension 0 varying fastest. `events` counts the
/// events that landed in each bin and is informational only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Histogram {
    pub axes: Vec<Axis>,
    pub signal: Vec<f64>,
    pub error_sq: Vec<f64>,
    pub events: Vec<u64>,
}

impl Histogram {
    pub fn zeros(axes: Vec<Axis>) -> Self {
        let n: usize = axes.iter().map(|a| a.n_bins()).product();
        Histogram { axes, signal: vec![0.0; n], error_sq: vec![0.0; n], events: vec![0; n] }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.n_bins()).collect()
    }

    pub fn n_bins(&self) -> usize {
        self.signal.len()
    }

    pub fn strides(&self) -> Vec<usize> {
        let mut strides = Vec::with_capacity(self.axes.len());
        let mut stride = 1;
        for axis in &self.axes {
            strides.push(stride);
            stride *= axis.n_bins();
        }
        strides
    }

    pub fn same_shape(&self, other: &Histogram) -> bool {
        self.shape() == other.shape()
    }

    /// Same shape and the same bin edges on every axis.
    pub fn same_grid(&self, other: &Histogram) -> bool {
        self.same_shape(other)
            && self.axes.iter().zip(&other.axes).all(|(a, b)| Histogram::axes_match(a, b))
    }

    fn ensure_same_grid(&self, other: &Histogram, what: &str) -> Result<()> {
        if !self.same_shape(other) {
            return Err(SliceError::computation(format!(
                "cannot {} histograms of shapes {:?} and {:?}",
                what,
                self.shape(),
                other.shape()
            )));
        }
        match self.axes.iter().zip(&other.axes).find(|(a, b)| !Histogram::axes_match(a, b)) {
            Some((a, b)) => Err(SliceError::computation(format!(
                "cannot {} histograms binned differently along '{}': {:?} and {:?}",
                what, a.name, a.edges, b.edges
            ))),
            None => Ok(()),
        }
    }

    fn axes_match(a: &Axis, b: &Axis) -> bool {
        a.edges.iter().zip(&b.edges).all(|(x, y)| (x - y).abs() <= 1e-9 * x.abs().max(1.0))
    }

    /// Adds the contents of `other` bin by bin.
    pub fn merge(&mut self, other: &Histogram) {
        for i in 0..self.signal.len() {
            self.signal[i] += other.signal[i];
            self.error_sq[i] += other.error_sq[i];
            self.events[i] += other.events[i];
        }
    }

    /// `self - other`; squared errors add, `NaN` bins stay `NaN`.
    pub fn checked_sub(&self, other: &Histogram) -> Result<Histogram> {
        self.ensure_same_grid(other, "subtract")?;
        let signal = self.signal.iter().zip(&other.signal).map(|(a, b)| a - b).collect();
        let error_sq = self.error_sq.iter().zip(&other.error_sq).map(|(a, b)| a + b).collect();
        Ok(Histogram { axes: self.axes.clone(), signal, error_sq, events: self.events.clone() })
    }

    /// Divides by a normalization histogram. Bins whose normalization is zero
    /// or not finite become `NaN`.
    pub fn divide(&self, norm: &Histogram) -> Result<Histogram> {
        self.ensure_same_grid(norm, "divide")?;
        let mut signal = Vec::with_capacity(self.n_bins());
        let mut error_sq = Vec::with_capacity(self.n_bins());
        for i in 0..self.n_bins() {
            let n = norm.signal[i];
            if n == 0.0 || !n.is_finite() {
                signal.push(f64::NAN);
                error_sq.push(f64::NAN);
            } else {
                signal.push(self.signal[i] / n);
                error_sq.push(self.error_sq[i] / (n * n));
            }
        }
        Ok(Histogram { axes: self.axes.clone(), signal, error_sq, events: self.events.clone() })
    }

    pub fn scaled(&self, factor: f64) -> Histogram {
        Histogram {
            axes: self.axes.clone(),
            signal: self.signal.iter().map(|v| v * factor).collect(),
            error_sq: self.error_sq.iter().map(|v| v * factor * factor).collect(),
            events: self.events.clone(),
        }
    }

    pub fn finite_bins(&self) -> usize {
        self.signal.iter().filter(|v| v.is_finite()).count()
    }

    /// Sum over finite bins.
    pub fn total_signal(&self) -> f64 {
        self.signal.iter().filter(|v| v.is_finite()).sum()
    }

    pub fn errors(&self) -> Vec<f64> {
        self.error_sq.iter().map(|e| e.sqrt()).collect()
    }
}

impl Display for Histogram {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.axes.iter().map(|a| format!("{}: {}", a.name, a.n_bins())).collect();
        write!(
            f,
            "Histogram(dims: [{}], bins: {}, finite: {}, total: {})",
            dims.join(", "),
            self.n_bins(),
            self.finite_bins(),
            self.total_signal()
        )
    }
}

/// Signal and normalization histograms of identical shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct BinnedPair {
    pub data: Histogram,
    pub norm: Histogram,
}

impl BinnedPair {
    pub fn new(data: Histogram, norm: Histogram) -> Self {
        BinnedPair { data, norm }
    }

    pub fn zeros(axes: Vec<Axis>) -> Self {
        BinnedPair { data: Histogram::zeros(axes.clone()), norm: Histogram::zeros(axes) }
    }

    pub fn merge(&mut self, other: &BinnedPair) {
        self.data.merge(&other.data);
        self.norm.merge(&other.norm);
    }

    /// `signal / normalization`, `NaN` where the normalization is zero.
    pub fn intensity(&self) -> Result<Histogram> {
        self.data.divide(&self.norm)
    }
}
