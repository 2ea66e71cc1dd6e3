pub mod config;
pub mod task;
pub mod store;
pub mod validate;
pub mod transcode;
pub mod scheduler;
pub mod probe;

pub use config::DaemonConfig;
pub use task::{Task, TaskStatus};
pub use store::{StoreError, TaskStore};
pub use validate::{ValidationError, Validator};
pub use transcode::{FfmpegTranscoder, Transcode, TranscodeResult};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use probe::MediaInfo;
