//! Antenna layout, virtual-array synthesis and the angular search grid.

pub mod angle_grid;
pub mod layout;
pub mod virtual_array;

pub use angle_grid::AngleGrid;
pub use layout::{ArrayGeometry, Element, Multiplexing, Polarization};
pub use virtual_array::{OverlapReport, PolarizationPair, VirtualArray, VirtualElement};
