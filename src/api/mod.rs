//! Consumer-facing request surface.
//!
//! A [`ProviderBackend`] knows one service; [`ApiFacade`] wraps it with
//! descriptor validation, the shared cache, the scheduler and guarded
//! recovery. [`HttpTransport`] is the reqwest executor backends build on.

pub mod backend;
pub mod descriptor;
pub mod facade;
pub mod transport;

pub use backend::ProviderBackend;
pub use descriptor::{DescriptorFields, MediaType, RequestDescriptor, Target, MAL_PROVIDER};
pub use facade::{ApiFacade, DataSource, FetchResult};
pub use transport::{HttpCall, HttpTransport};
