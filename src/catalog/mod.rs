//! Package catalog access: searching for packages and downloading their
//! installers through the catalog tool's command line.

pub mod client;
pub mod parser;

pub use client::CatalogClient;
pub use parser::parse_search_output;
