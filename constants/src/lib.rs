pub mod binning;
pub mod histogram;
pub mod store;
