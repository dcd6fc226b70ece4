mod scheduler;

pub use scheduler::{CronScheduler, TickFn};
