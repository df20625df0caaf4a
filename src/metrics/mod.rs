mod registry;

pub use registry::install;
