//! Provider adapter abstractions.
//!
//! - `ProviderAdapter`: RPITIT trait implemented once per backend kind
//! - `BoxProviderAdapter`: object-safe wrapper for dynamic dispatch

pub mod box_provider;
pub mod provider;
