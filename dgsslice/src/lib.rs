// src/lib.rs
pub mod slice {
    pub mod background;
    pub mod polarized;
    pub mod slicer;
    pub mod queue;
}

pub mod store;
pub mod corrections;
pub mod config;
