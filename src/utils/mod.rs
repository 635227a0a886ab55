pub mod async_task;
mod keys;

pub use keys::*;

#[cfg(test)]
mod async_task_test;
#[cfg(test)]
mod keys_test;
