use std::path::Path;

use serde::{Deserialize, Serialize};

use dgscore::algorithm::accumulate::NormalizationSource;
use dgscore::data::binning::{BinningSpec, DimensionBinning};
use dgscore::error::{Result, SliceError};

use crate::corrections::CorrectionParams;
use crate::slice::slicer::SliceParams;

/// One binned dimension as written in a request file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DimensionConfig {
    pub name: String,
    /// `"1,0,0"` style projection vector, momentum dimensions only.
    #[serde(default)]
    pub projection: Option<String>,
    /// `"min,step,max"`, `"min,max"` or empty for the full extent.
    #[serde(default)]
    pub range: String,
}

impl DimensionConfig {
    pub fn new(name: &str, projection: Option<&str>, range: &str) -> Self {
        DimensionConfig { name: name.to_string(), projection: projection.map(str::to_string), range: range.to_string() }
    }
}

/// Settings shared by single-channel and polarized requests.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceOptions {
    pub binning: Vec<DimensionConfig>,
    pub symmetry: Option<String>,
    /// Gaussian FWHM in bins, one value for all dimensions or one per dimension.
    pub smoothing: Option<Vec<f64>>,
    pub normalization: NormalizationSource,
    pub corrections: Vec<String>,
    pub correction_params: CorrectionParams,
    pub retain_intermediates: bool,
}

impl SliceOptions {
    pub fn binning_spec(&self) -> Result<BinningSpec> {
        if self.binning.is_empty() {
            return Err(SliceError::config("no binned dimensions given"));
        }
        let dimensions = self
            .binning
            .iter()
            .map(|d| DimensionBinning::parse(&d.name, d.projection.as_deref(), &d.range))
            .collect::<Result<Vec<_>>>()?;
        let spec = BinningSpec::new(dimensions);
        match self.symmetry.as_deref() {
            Some(text) if !text.trim().is_empty() => spec.with_symmetry_str(text),
            _ => Ok(spec),
        }
    }

    pub fn params(&self) -> Result<SliceParams> {
        Ok(SliceParams::new(self.binning_spec()?)
            .with_normalization(self.normalization.clone())
            .with_smoothing(self.smoothing.clone()))
    }
}

/// Single-channel slice: `data` and `background` name event sets in the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SliceRequest {
    pub name: String,
    pub data: String,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(flatten)]
    pub options: SliceOptions,
}

/// Spin-flip / non-spin-flip pair sharing one flipping ratio.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolarizedSliceRequest {
    pub name: String,
    pub sf: String,
    pub nsf: String,
    /// Number or `"<formula>,<var1>,..."`.
    #[serde(default)]
    pub flipping_ratio: Option<String>,
    #[serde(default)]
    pub sf_background: Option<String>,
    #[serde(default)]
    pub nsf_background: Option<String>,
    #[serde(flatten)]
    pub options: SliceOptions,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| SliceError::config(format!("{}: {}", path.display(), e)))
}

impl SliceRequest {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        read_json(path)
    }
}

impl PolarizedSliceRequest {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        read_json(path)
    }
}
