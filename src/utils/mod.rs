pub mod retry;

pub use retry::{backoff_delay, with_backoff, with_retry};
