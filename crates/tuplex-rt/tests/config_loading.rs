mod common;

use std::io::Write;

use tuplex_rt::{Config, ConfigError, Context, Grain, RuntimeError, StepCx, StepResult};

#[test]
fn context_reads_a_config_file() {
    common::init_logging();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "num_threads = 3").unwrap();
    writeln!(file, "default_grain = 8").unwrap();
    writeln!(file, "thread_name_prefix = \"cfg-worker\"").unwrap();

    let ctx = Context::builder().config_file(file.path()).ignore_env().build().unwrap();
    assert_eq!(ctx.config().num_threads, 3);
    assert_eq!(ctx.config().default_grain, Grain::Fixed(8));
    assert_eq!(ctx.scheduler().num_workers(), 3);

    let names = ctx.item_collection::<u32, String>("names");
    let tags = ctx.tag_collection::<u32>("tags");
    let out = names.clone();
    let step = ctx.step_collection("name", move |t: &u32, cx: &mut StepCx| -> StepResult {
        let name = std::thread::current().name().unwrap_or_default().to_string();
        cx.put(&out, *t, name);
        Ok(())
    });
    tags.prescribes(&step).unwrap();
    tags.put(1);
    ctx.wait();
    assert!(names.try_get(&1).unwrap().starts_with("cfg-worker"));
}

#[test]
fn builder_setters_win_over_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tuplex.toml");
    std::fs::write(&path, "num_threads = 3\nwait_poll_ms = 7\n").unwrap();

    let ctx = Context::builder()
        .config_file(&path)
        .ignore_env()
        .num_threads(1)
        .grain(Grain::Never)
        .build()
        .unwrap();
    assert_eq!(ctx.config().num_threads, 1);
    assert_eq!(ctx.config().wait_poll_ms, 7);
    assert_eq!(ctx.config().default_grain, Grain::Never);
}

#[test]
fn missing_config_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let err = Context::builder()
        .config_file(dir.path().join("absent.toml"))
        .ignore_env()
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, RuntimeError::Config(ConfigError::Read { .. })));
}

#[test]
fn zero_threads_means_one_per_cpu() {
    let config = Config {
        num_threads: 0,
        ..Config::default()
    };
    let expected = config.worker_threads();
    let ctx = Context::new(config).unwrap();
    assert_eq!(ctx.scheduler().num_workers(), expected);
}
