//! Durable, priority-ordered job queue and its bounded worker pool.

pub mod job_queue;
pub mod worker;

pub use job_queue::{Job, JobQueue, JobStatus, PRIORITY_DEFAULT, PRIORITY_HIGH};
pub use worker::{JobDispatcher, WorkerPool, spawn_worker_pool};
