mod client;

pub use client::{ApiErrorClass, BackendError, CollectionClient, Match, RecordStamp};
pub use reqwest::StatusCode;
