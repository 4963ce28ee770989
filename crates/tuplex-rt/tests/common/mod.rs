#![allow(dead_code)]

use tuplex_rt::{Config, Context};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A context with `threads` workers that ignores the environment.
pub fn context(threads: usize) -> Context {
    init_logging();
    let config = Config {
        num_threads: threads,
        ..Config::default()
    };
    Context::new(config).unwrap()
}
