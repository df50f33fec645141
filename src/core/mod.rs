//! Core module - Catalog, container records, runtime client and lifecycle management

mod app_state;
pub mod catalog;
pub mod confirm;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod monitor;
pub mod record;
pub mod resource;
pub mod runtime;
pub mod settings;

pub use app_state::AppState;
pub use lifecycle::{LifecycleEvent, VpsManager};
pub use monitor::SystemCpuSampler;
pub use runtime::LxcRuntime;
pub use settings::Settings;
