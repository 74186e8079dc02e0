//! ECG-Processing: segmentation and filtering for the acquisition pipeline
//!
//! Cuts packets into overlapping windows, designs the notch, equiripple
//! and elliptic stages once, and applies them zero-phase per window.

pub mod cascade;
pub mod config;
pub mod design;
pub mod filters;
pub mod spectrum;
pub mod windower;

pub use cascade::{normalize_min_max, CascadeBuilder, FilterCascade};
pub use config::{BandEdges, CascadeConfig, NotchConfig, WindowingConfig};
pub use filters::{FilterKind, FilterStage, TransferFunction};
pub use spectrum::{attenuation_db, Spectrum};
pub use windower::{Windower, WindowerStats};
