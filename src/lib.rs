pub mod api;
pub mod bus;
pub mod commands;
pub mod db;
pub mod logging;
pub mod models;
pub mod settings;
pub mod store;
pub mod uploader;

pub use api::{ApiClient, ApiError, ObservationApi};
pub use bus::{SubscriptionBus, SubscriptionId, TaskEvent};
pub use models::{ObservationForm, SubmissionExtra, Task, TaskId, TaskStatus};
pub use settings::UploaderConfig;
pub use store::{StoreError, TaskStore};
pub use uploader::{Outcome, Uploader, UploaderError};
