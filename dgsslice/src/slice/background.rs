use std::fmt::{Display, Formatter};

use tracing::debug;

use dgscore::data::events::Frame;
use dgscore::data::histogram::Histogram;
use dgscore::error::{Result, SliceError};

/// How the background of a slice was produced, and therefore where it is
/// subtracted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackgroundPolicy {
    /// No background given.
    None,
    /// Smoothing requested: the background pair was smoothed and divided on
    /// its own. A lab-frame background is still binned against the data
    /// orientations first.
    Smoothed,
    /// Sample-frame background accumulated and divided separately.
    SampleFrame,
    /// Lab-frame background accumulated together with the data.
    LabFrameJoint,
}

impl BackgroundPolicy {
    pub fn select(smoothing: bool, frame: Option<Frame>) -> Self {
        match (frame, smoothing) {
            (None, _) => BackgroundPolicy::None,
            (Some(_), true) => BackgroundPolicy::Smoothed,
            (Some(Frame::Sample), false) => BackgroundPolicy::SampleFrame,
            (Some(Frame::Lab), false) => BackgroundPolicy::LabFrameJoint,
        }
    }
}

impl Display for BackgroundPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackgroundPolicy::None => "none",
            BackgroundPolicy::Smoothed => "smoothed",
            BackgroundPolicy::SampleFrame => "sample frame",
            BackgroundPolicy::LabFrameJoint => "lab frame (joint)",
        };
        write!(f, "{}", name)
    }
}

/// Subtracts the background intensity from the data intensity.
///
/// Every policy subtracts exactly once, here. `NaN` in either operand stays
/// `NaN` in the result.
pub fn combine(data: &Histogram, background: Option<&Histogram>, policy: BackgroundPolicy) -> Result<Histogram> {
    match (background, policy) {
        (None, _) => Ok(data.clone()),
        (Some(_), BackgroundPolicy::None) => {
            Err(SliceError::config("a background intensity was given without a background policy"))
        }
        (Some(bkg), policy) => {
            debug!(policy = %policy, bins = data.n_bins(), "subtracting background");
            data.checked_sub(bkg)
        }
    }
}
