pub mod backend;
pub mod calibration;
pub mod config;
pub mod data_loading;
pub mod error;
pub mod filters;
pub mod heart_analysis;
pub mod output;
pub mod preprocessing;
pub mod session;

pub use backend::{Acceleration, BackendKind, Dispatcher};
pub use config::{Args, LeadLayout, PipelineConfig};
pub use data_loading::{HeaderDecision, Recording, WindowRequest};
pub use error::{BackendError, FilterError, ViewerError, ViewerResult};
pub use filters::FilterSpec;
pub use session::{BufferPair, LoadReport, LoadStatus, RenderedWindow, Session, WindowRate};
