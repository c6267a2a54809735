mod job;
mod retry;
mod run;
mod worker;

pub use job::{JobError, RunReport};
pub use run::run;
