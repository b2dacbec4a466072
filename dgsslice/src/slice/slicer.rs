use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::FxHasher;
use tracing::{debug, info, warn};

use dgscore::algorithm::accumulate::{accumulate, NormalizationSource};
use dgscore::algorithm::smoothing::{is_identity, smooth};
use dgscore::data::binning::BinningSpec;
use dgscore::data::events::{EventSet, Frame};
use dgscore::data::histogram::{BinnedPair, Histogram};
use dgscore::error::Result;

use crate::config::{PolarizedSliceRequest, SliceOptions, SliceRequest};
use crate::corrections::CorrectionRegistry;
use crate::slice::background::{combine, BackgroundPolicy};
use crate::slice::polarized::{FlippingRatioCorrector, PolarizedSliceParams};
use crate::store::{Artifact, ArtifactStore};

/// Everything needed to turn one event set into an intensity histogram.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceParams {
    pub binning: BinningSpec,
    pub normalization: NormalizationSource,
    pub smoothing: Option<Vec<f64>>,
}

impl SliceParams {
    pub fn new(binning: BinningSpec) -> Self {
        SliceParams { binning, normalization: NormalizationSource::Unit, smoothing: None }
    }

    pub fn with_normalization(mut self, normalization: NormalizationSource) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_smoothing(mut self, smoothing: Option<Vec<f64>>) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn smoothing(&self) -> Option<&[f64]> {
        self.smoothing.as_deref()
    }

    pub fn is_smoothed(&self) -> bool {
        !is_identity(self.smoothing())
    }

    /// Copy whose automatic ranges are fixed to the extents of `events`.
    pub fn pinned_to(&self, events: &EventSet) -> Result<SliceParams> {
        Ok(SliceParams { binning: self.binning.pinned_to(events)?, ..self.clone() })
    }

    /// Hex key identifying binning and normalization, used to name cached
    /// background accumulations.
    pub fn cache_key(&self) -> String {
        let mut hasher = FxHasher::default();
        self.binning.fingerprint().hash(&mut hasher);
        format!("{:?}", self.normalization).hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// One reduced channel with the raw accumulations it came from.
#[derive(Clone, Debug)]
pub struct ChannelResult {
    pub intensity: Histogram,
    /// Unsmoothed signal/normalization of the data.
    pub data: BinnedPair,
    /// Unsmoothed signal/normalization of the background, if any.
    pub background: Option<BinnedPair>,
    pub policy: BackgroundPolicy,
    /// False when the background pair was taken from `cached_background`.
    pub background_computed: bool,
}

/// Single-channel pipeline: accumulate, smooth, divide, subtract.
///
/// A lab-frame background is accumulated together with the data. A
/// sample-frame background is accumulated on its own, on the grid of the
/// data, unless `cached_background` already holds that accumulation.
pub fn reduce_channel(
    events: &EventSet,
    background: Option<&EventSet>,
    params: &SliceParams,
    cached_background: Option<&BinnedPair>,
) -> Result<ChannelResult> {
    let params = &params.pinned_to(events)?;
    let policy = BackgroundPolicy::select(params.is_smoothed(), background.map(|b| b.frame));
    debug!(name = %events.name, policy = %policy, "reducing channel");

    let mut background_computed = false;
    let (data, background) = match background {
        None => (accumulate(events, &params.binning, &params.normalization, None)?.data, None),
        Some(bkg) if bkg.frame == Frame::Lab => {
            let acc = accumulate(events, &params.binning, &params.normalization, Some(bkg))?;
            background_computed = true;
            (acc.data, acc.background)
        }
        Some(bkg) => {
            let data = accumulate(events, &params.binning, &params.normalization, None)?.data;
            let pair = match cached_background {
                Some(pair) => {
                    debug!(background = %bkg.name, "using cached background accumulation");
                    pair.clone()
                }
                None => {
                    background_computed = true;
                    accumulate(bkg, &params.binning, &params.normalization, None)?.data
                }
            };
            (data, Some(pair))
        }
    };

    let data_intensity = smooth(&data, params.smoothing())?.intensity()?;
    let background_intensity = match &background {
        Some(pair) => Some(smooth(pair, params.smoothing())?.intensity()?),
        None => None,
    };
    let intensity = combine(&data_intensity, background_intensity.as_ref(), policy)?;

    Ok(ChannelResult { intensity, data, background, policy, background_computed })
}

/// Reduces `events` with an optional background into one intensity histogram.
pub fn make_slice(events: &EventSet, params: &SliceParams, background: Option<&EventSet>) -> Result<Histogram> {
    Ok(reduce_channel(events, background, params, None)?.intensity)
}

/// Runs slice requests against named event sets in an [`ArtifactStore`].
pub struct Slicer {
    store: ArtifactStore,
    corrections: CorrectionRegistry,
}

impl Slicer {
    pub fn new(store: ArtifactStore) -> Self {
        Slicer { store, corrections: CorrectionRegistry::default() }
    }

    pub fn with_corrections(mut self, corrections: CorrectionRegistry) -> Self {
        self.corrections = corrections;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ArtifactStore {
        &mut self.store
    }

    pub fn corrections(&self) -> &CorrectionRegistry {
        &self.corrections
    }

    /// Loads an event set and applies the requested corrections to it.
    fn prepare(&mut self, name: &str, options: &SliceOptions) -> Result<Arc<EventSet>> {
        let events = self.store.load_event_set(name)?;
        match self.corrections.apply_all(&options.corrections, &events, &options.correction_params)? {
            Some(corrected) => Ok(Arc::new(corrected)),
            None => Ok(events),
        }
    }

    fn background_cache_name(background: &EventSet, params: &SliceParams, options: &SliceOptions) -> String {
        let mut hasher = FxHasher::default();
        params.cache_key().hash(&mut hasher);
        background.content_hash().hash(&mut hasher);
        options.corrections.hash(&mut hasher);
        if !options.corrections.is_empty() {
            format!("{:?}", options.correction_params).hash(&mut hasher);
        }
        format!("{}_{:016x}", background.name, hasher.finish())
    }

    fn cached_pair(&self, key: &str) -> Option<BinnedPair> {
        let data = self.store.histogram(&format!("{}_data", key))?;
        let norm = self.store.histogram(&format!("{}_norm", key))?;
        Some(BinnedPair::new(data.clone(), norm.clone()))
    }

    fn insert_pair(&mut self, prefix: &str, pair: &BinnedPair) {
        self.store.insert(&format!("{}_data", prefix), Artifact::Histogram(pair.data.clone()));
        self.store.insert(&format!("{}_norm", prefix), Artifact::Histogram(pair.norm.clone()));
    }

    fn remove_intermediates(&mut self, names: &[String]) {
        for name in names {
            self.store.remove(name);
        }
    }

    /// Reduces the event set `request.data` into the histogram
    /// `request.name`, which is also kept in the store.
    pub fn make_slice(&mut self, request: &SliceRequest) -> Result<Histogram> {
        let params = request.options.params()?;
        let events = self.prepare(&request.data, &request.options)?;
        let params = params.pinned_to(&events)?;
        let background = match &request.background {
            Some(name) => Some(self.prepare(name, &request.options)?),
            None => None,
        };

        let cache_name = match &background {
            Some(bkg) if bkg.frame == Frame::Sample => {
                Some(Self::background_cache_name(bkg, &params, &request.options))
            }
            _ => None,
        };
        let cached = cache_name.as_deref().and_then(|key| self.cached_pair(key));

        let result = reduce_channel(&events, background.as_deref(), &params, cached.as_ref())?;

        if let (Some(key), Some(pair), true) = (&cache_name, &result.background, result.background_computed) {
            debug!(key = %key, "caching background accumulation");
            self.insert_pair(key, pair);
        }

        let mut intermediates = vec![format!("{}_data", request.name), format!("{}_norm", request.name)];
        self.insert_pair(&request.name, &result.data);
        if let Some(pair) = &result.background {
            let prefix = format!("{}_background", request.name);
            self.insert_pair(&prefix, pair);
            intermediates.push(format!("{}_data", prefix));
            intermediates.push(format!("{}_norm", prefix));
        }

        let output = result.intensity;
        if output.finite_bins() == 0 {
            warn!(name = %request.name, "slice has no finite bins");
        }
        self.store.insert(&request.name, Artifact::Histogram(output.clone()));
        if !request.options.retain_intermediates {
            self.remove_intermediates(&intermediates);
        }

        info!(
            name = %request.name,
            data = %request.data,
            background = ?request.background,
            policy = %result.policy,
            shape = ?output.shape(),
            finite = output.finite_bins(),
            "slice ready"
        );
        Ok(output)
    }

    /// Flipping-ratio corrected spin-flip / non-spin-flip pair, stored as
    /// `<name>_SF` and `<name>_NSF`.
    pub fn make_paired_slice(&mut self, request: &PolarizedSliceRequest) -> Result<(Histogram, Histogram)> {
        let corrector = FlippingRatioCorrector::new(request.flipping_ratio.as_deref())?;
        let params = request.options.params()?;

        let sf = self.prepare(&request.sf, &request.options)?;
        let nsf = self.prepare(&request.nsf, &request.options)?;
        let sf_background = match &request.sf_background {
            Some(name) => Some(self.prepare(name, &request.options)?),
            None => None,
        };
        let nsf_background = match &request.nsf_background {
            Some(name) => Some(self.prepare(name, &request.options)?),
            None => None,
        };

        let polarized = PolarizedSliceParams { slice: params, sf_background, nsf_background };
        let result = corrector.correct(&sf, &nsf, &polarized)?;

        let mut intermediates = Vec::with_capacity(result.partials.len());
        for (suffix, partial) in &result.partials {
            let name = format!("{}_{}", request.name, suffix);
            self.store.insert(&name, Artifact::Histogram(partial.clone()));
            intermediates.push(name);
        }

        let sf_name = format!("{}_SF", request.name);
        let nsf_name = format!("{}_NSF", request.name);
        self.store.insert(&sf_name, Artifact::Histogram(result.sf.clone()));
        self.store.insert(&nsf_name, Artifact::Histogram(result.nsf.clone()));
        if !request.options.retain_intermediates {
            self.remove_intermediates(&intermediates);
        }

        info!(
            name = %request.name,
            flipping_ratio = %corrector.ratio(),
            shape = ?result.sf.shape(),
            finite_sf = result.sf.finite_bins(),
            finite_nsf = result.nsf.finite_bins(),
            "polarized slice ready"
        );
        Ok((result.sf, result.nsf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DimensionConfig;
    use dgscore::data::events::{Dimension, RunInfo, Trajectory};
    use dgscore::error::SliceError;

    /// Ten events on `H ∈ [0, 1]`, each with a trajectory covering its bin.
    fn line(name: &str, frame: Frame, scale: f64) -> EventSet {
        let mut events = EventSet::new(
            name,
            frame,
            vec![
                Dimension::momentum("H", -1.0, 1.0),
                Dimension::momentum("K", -1.0, 1.0),
                Dimension::momentum("L", -1.0, 1.0),
                Dimension::energy("DeltaE", 0.0, 10.0),
            ],
        );
        let run = events.add_run(RunInfo::default().with_log("temperature", 50.0));
        for i in 0..10 {
            let lo = i as f64 * 0.1;
            events.push_event(&[lo + 0.05, 0.0, 0.0, 5.0], scale * (i + 1) as f64, scale, run, i);
            events.add_trajectory(Trajectory::new(run, i, vec![lo, 0.0, 0.0, 5.0], vec![lo + 0.1, 0.0, 0.0, 5.0], 1.0));
        }
        events
    }

    fn options() -> SliceOptions {
        SliceOptions {
            binning: vec![
                DimensionConfig::new("H", Some("1,0,0"), "0,0.1,1"),
                DimensionConfig::new("K", Some("0,1,0"), "-0.5,0.5"),
                DimensionConfig::new("L", Some("0,0,1"), "-0.5,0.5"),
                DimensionConfig::new("DeltaE", None, "0,10"),
            ],
            ..SliceOptions::default()
        }
    }

    fn request(background: Option<&str>) -> SliceRequest {
        SliceRequest {
            name: "slice".to_string(),
            data: "data".to_string(),
            background: background.map(str::to_string),
            options: options(),
        }
    }

    #[test]
    fn test_make_slice_stores_output_only() {
        let mut store = ArtifactStore::new();
        store.insert_events(line("data", Frame::Sample, 1.0));
        let mut slicer = Slicer::new(store);
        let slice = slicer.make_slice(&request(None)).unwrap();
        assert_eq!(slice.shape(), vec![10, 1, 1, 1]);
        assert!((slice.signal[3] - 4.0).abs() < 1e-12);
        assert!(slicer.store().histogram("slice").is_some());
        assert!(!slicer.store().contains("slice_data"));
        assert!(!slicer.store().contains("slice_norm"));
    }

    #[test]
    fn test_retained_intermediates() {
        let mut store = ArtifactStore::new();
        store.insert_events(line("data", Frame::Sample, 1.0));
        store.insert_events(line("bkg", Frame::Lab, 0.1));
        let mut slicer = Slicer::new(store);
        let mut req = request(Some("bkg"));
        req.options.retain_intermediates = true;
        slicer.make_slice(&req).unwrap();
        for name in ["slice_data", "slice_norm", "slice_background_data", "slice_background_norm"] {
            assert!(slicer.store().contains(name), "{} missing", name);
        }
    }

    #[test]
    fn test_missing_background_is_not_found() {
        let mut store = ArtifactStore::new();
        store.insert_events(line("data", Frame::Sample, 1.0));
        let mut slicer = Slicer::new(store);
        let err = slicer.make_slice(&request(Some("empty_can"))).unwrap_err();
        assert!(matches!(err, SliceError::NotFound(_)));
        assert!(!slicer.store().contains("slice"));
    }

    #[test]
    fn test_sample_background_is_cached() {
        let mut store = ArtifactStore::new();
        store.insert_events(line("data", Frame::Sample, 1.0));
        store.insert_events(line("bkg", Frame::Sample, 0.1));
        let mut slicer = Slicer::new(store);
        let first = slicer.make_slice(&request(Some("bkg"))).unwrap();
        for i in 0..10 {
            assert!((first.signal[i] - 0.9 * (i + 1) as f64).abs() < 1e-12);
        }

        let cached: Vec<String> =
            slicer.store().names().into_iter().filter(|n| n.starts_with("bkg_") && n.ends_with("_norm")).collect();
        assert_eq!(cached.len(), 1);

        let second = slicer.make_slice(&request(Some("bkg"))).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_replaced_background_is_not_served_from_cache() {
        let mut store = ArtifactStore::new();
        store.insert_events(line("data", Frame::Sample, 1.0));
        store.insert_events(line("bkg", Frame::Sample, 0.1));
        let mut slicer = Slicer::new(store);
        let first = slicer.make_slice(&request(Some("bkg"))).unwrap();
        assert!((first.signal[4] - 4.5).abs() < 1e-12);

        slicer.store_mut().insert_events(line("bkg", Frame::Sample, 0.5));
        let second = slicer.make_slice(&request(Some("bkg"))).unwrap();
        for i in 0..10 {
            assert!((second.signal[i] - 0.5 * (i + 1) as f64).abs() < 1e-12);
        }
    }

    #[test]
    fn test_auto_range_background_uses_data_grid() {
        let mut store = ArtifactStore::new();
        store.insert_events(line("data", Frame::Sample, 1.0));
        let mut bkg = line("bkg", Frame::Sample, 0.1);
        bkg.dimensions[1] = Dimension::momentum("K", -4.0, 4.0);
        store.insert_events(bkg);
        let mut slicer = Slicer::new(store);

        let mut req = request(Some("bkg"));
        req.options.binning[1] = DimensionConfig::new("K", Some("0,1,0"), "");
        req.options.retain_intermediates = true;
        let slice = slicer.make_slice(&req).unwrap();
        assert_eq!(slice.axes[1].edges, vec![-1.0, 1.0]);
        assert_eq!(slicer.store().histogram("slice_background_data").unwrap().axes[1].edges, vec![-1.0, 1.0]);
        for i in 0..10 {
            assert!((slice.signal[i] - 0.9 * (i + 1) as f64).abs() < 1e-12);
        }
    }

    #[test]
    fn test_corrections_are_applied() {
        let mut store = ArtifactStore::new();
        store.insert_events(line("data", Frame::Sample, 1.0));
        let mut slicer = Slicer::new(store);
        let mut req = request(None);
        req.options.corrections = vec!["detailed_balance".to_string()];
        let slice = slicer.make_slice(&req).unwrap();
        let factor = std::f64::consts::PI * (1.0 - (-5.0f64 / (crate::corrections::BOLTZMANN_MEV_PER_K * 50.0)).exp());
        assert!((slice.signal[0] - factor).abs() < 1e-12);

        req.options.corrections = vec!["absorption".to_string()];
        assert!(matches!(slicer.make_slice(&req).unwrap_err(), SliceError::Configuration(_)));
    }

    #[test]
    fn test_cache_key_depends_on_normalization() {
        let params = options().params().unwrap();
        let other = params.clone().with_normalization(NormalizationSource::Constant(2.0));
        assert_ne!(params.cache_key(), other.cache_key());
        assert_eq!(params.cache_key(), options().params().unwrap().cache_key());
    }
}
