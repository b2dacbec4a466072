use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use dgscore::algorithm::expression::FlippingRatio;
use dgscore::data::events::EventSet;
use dgscore::data::histogram::Histogram;
use dgscore::error::{Result, SliceError};

use crate::slice::slicer::{make_slice, SliceParams};

/// Single-channel settings plus the optional per-channel backgrounds.
#[derive(Clone, Debug)]
pub struct PolarizedSliceParams {
    pub slice: SliceParams,
    pub sf_background: Option<Arc<EventSet>>,
    pub nsf_background: Option<Arc<EventSet>>,
}

impl PolarizedSliceParams {
    pub fn new(slice: SliceParams) -> Self {
        PolarizedSliceParams { slice, sf_background: None, nsf_background: None }
    }

    pub fn with_backgrounds(mut self, sf: Option<Arc<EventSet>>, nsf: Option<Arc<EventSet>>) -> Self {
        self.sf_background = sf;
        self.nsf_background = nsf;
        self
    }
}

#[derive(Clone, Debug)]
pub struct PolarizedResult {
    pub sf: Histogram,
    pub nsf: Histogram,
    /// Intensities of `SF_F`, `SF_1`, `NSF_F`, `NSF_1`, in that order.
    pub partials: Vec<(String, Histogram)>,
}

/// Undoes the mixing of spin-flip and non-spin-flip scattering caused by a
/// finite flipping ratio `R`.
///
/// With measured intensities `SF = (R·s + n) / (R + 1)` and
/// `NSF = (R·n + s) / (R + 1)`, the true channels are
/// `s = R/(R-1)·SF - 1/(R-1)·NSF` and `n = R/(R-1)·NSF - 1/(R-1)·SF`.
/// The weights are applied per event since `R` may depend on sample logs.
#[derive(Clone, Debug)]
pub struct FlippingRatioCorrector {
    ratio: FlippingRatio,
}

impl FlippingRatioCorrector {
    pub fn new(expression: Option<&str>) -> Result<Self> {
        Ok(FlippingRatioCorrector { ratio: FlippingRatio::parse(expression)? })
    }

    pub fn ratio(&self) -> &FlippingRatio {
        &self.ratio
    }

    /// Splits `events` into `<name>_F` weighted by `R/(R-1)` and `<name>_1`
    /// weighted by `1/(R-1)`.
    pub fn decompose(&self, events: &EventSet) -> Result<(EventSet, EventSet)> {
        let ratios = self.ratio.evaluate(events)?;
        let mut w_f = Vec::with_capacity(ratios.len());
        let mut w_1 = Vec::with_capacity(ratios.len());
        for (i, r) in ratios.iter().enumerate() {
            if !r.is_finite() || *r == 1.0 {
                return Err(SliceError::computation(format!(
                    "flipping ratio {} of event {} in '{}' does not allow a correction",
                    r, i, events.name
                )));
            }
            w_f.push(r / (r - 1.0));
            w_1.push(1.0 / (r - 1.0));
        }
        Ok((
            events.scaled_by(&format!("{}_F", events.name), &w_f),
            events.scaled_by(&format!("{}_1", events.name), &w_1),
        ))
    }

    /// Corrected `(SF, NSF)` intensities. Automatic ranges are resolved
    /// against `sf`, so all four partials share one grid.
    pub fn correct(&self, sf: &EventSet, nsf: &EventSet, params: &PolarizedSliceParams) -> Result<PolarizedResult> {
        let slice = params.slice.pinned_to(sf)?;
        let (sf_f, sf_1) = self.decompose(sf)?;
        let (nsf_f, nsf_1) = self.decompose(nsf)?;
        let sf_bkg = params.sf_background.as_deref().map(|b| self.decompose(b)).transpose()?;
        let nsf_bkg = params.nsf_background.as_deref().map(|b| self.decompose(b)).transpose()?;

        let jobs: Vec<(&str, &EventSet, Option<&EventSet>)> = vec![
            ("SF_F", &sf_f, sf_bkg.as_ref().map(|(f, _)| f)),
            ("SF_1", &sf_1, sf_bkg.as_ref().map(|(_, one)| one)),
            ("NSF_F", &nsf_f, nsf_bkg.as_ref().map(|(f, _)| f)),
            ("NSF_1", &nsf_1, nsf_bkg.as_ref().map(|(_, one)| one)),
        ];
        debug!(ratio = %self.ratio, sf = %sf.name, nsf = %nsf.name, "reducing flipping-ratio partials");

        let partials: Vec<Histogram> = jobs
            .par_iter()
            .map(|(_, events, background)| make_slice(events, &slice, *background))
            .collect::<Result<Vec<_>>>()?;

        let corrected_sf = partials[0].checked_sub(&partials[3])?;
        let corrected_nsf = partials[2].checked_sub(&partials[1])?;

        let partials = jobs.iter().map(|(label, _, _)| label.to_string()).zip(partials).collect();
        Ok(PolarizedResult { sf: corrected_sf, nsf: corrected_nsf, partials })
    }
}

/// Corrected `(SF, NSF)` histograms for a pair of event sets.
pub fn make_paired_slice(
    sf: &EventSet,
    nsf: &EventSet,
    flipping_ratio: Option<&str>,
    params: &PolarizedSliceParams,
) -> Result<(Histogram, Histogram)> {
    let result = FlippingRatioCorrector::new(flipping_ratio)?.correct(sf, nsf, params)?;
    Ok((result.sf, result.nsf))
}
