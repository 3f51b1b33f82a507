pub mod cli;
pub mod distributions;
pub mod elbo;
pub mod error;
pub mod multi_view;
pub mod param_store;
pub mod svi;
pub mod trace;

pub use candle_core;
pub use candle_nn;

pub use elbo::{compute_site_log_r, ElboConfig, TraceElbo};
pub use error::{Result, SviError};
pub use param_store::ParamStore;
pub use svi::Svi;
pub use trace::{Program, Trace, TraceContext};
