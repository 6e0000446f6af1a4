pub mod background;
pub mod backoff;
pub mod clock;
pub mod coordinator;
pub mod engine;
pub mod mutation;
pub mod network;
pub mod queue;
pub mod wake;
