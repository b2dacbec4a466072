// data model
pub mod data {
    pub mod events;
    pub mod binning;
    pub mod histogram;
}

// algorithm module
pub mod algorithm {
    pub mod symmetry;
    pub mod accumulate;
    pub mod smoothing;
    pub mod expression;
}

pub mod error;

pub use error::{Result, SliceError};
