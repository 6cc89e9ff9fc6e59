pub mod background;
pub mod coadd;
pub mod constants;
pub mod cross_correlate;
pub mod dispersion;
pub mod exposure;
pub mod flatfield;
pub mod grismo;
pub mod grismo_errors;
mod numeric;
pub mod params;
pub mod pipeline;
pub mod positioner;
pub mod products;
pub mod trace;
pub mod wavelength;
