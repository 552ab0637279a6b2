//! Utility functions for volume preparation and export

pub mod intensity;
pub mod mask;

pub use intensity::{rescale_intensity, to_i16, to_u8};
pub use mask::{field_of_view_mask, intersect};
