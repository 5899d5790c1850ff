pub mod archive;
pub mod compress;
pub mod pipeline;
