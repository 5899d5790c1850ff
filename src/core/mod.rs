pub mod config;
pub mod diagnostics;
pub mod error;
pub mod framework;
pub mod packager;
pub mod res;
pub mod stream;
