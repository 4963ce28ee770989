mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tuplex_rt::{
    ActivityFlag, Blocked, CancelSet, Dependencies, Grain, HiddenGraph, ItemCollection, NotReady,
    StepCx, StepResult, StepTuner,
};

struct NeedsInput {
    input: ItemCollection<u32, u64>,
}

impl StepTuner<u32> for NeedsInput {
    fn depends(&self, tag: &u32, deps: &mut Dependencies) {
        deps.require(&self.input, tag);
    }
}

#[test]
fn declared_dependency_parks_until_put() {
    let ctx = common::context(2);
    let input = ctx.item_collection::<u32, u64>("input");
    let output = ctx.item_collection::<u32, u64>("output");
    let tags = ctx.tag_collection::<u32>("tags");
    let runs = Arc::new(AtomicUsize::new(0));

    let (src, out, counter) = (input.clone(), output.clone(), runs.clone());
    let step = ctx.step_collection_with(
        "double",
        move |t: &u32, cx: &mut StepCx| -> StepResult {
            counter.fetch_add(1, Ordering::SeqCst);
            let v = cx.get(&src, t)?;
            cx.put(&out, *t, v * 2);
            Ok(())
        },
        NeedsInput { input: input.clone() },
    );
    tags.prescribes(&step).unwrap();

    tags.put(9);
    ctx.wait();
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let unfinished = ctx.unfinished();
    assert_eq!(unfinished.len(), 1);
    assert!(unfinished[0].starts_with("double(9) [Prepared, 1 outstanding]"));

    input.put(9, 21);
    ctx.wait();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(output.try_get(&9), Some(42));
    assert!(ctx.unfinished().is_empty());
}

#[test]
fn rows_finish_once_their_seed_arrives() {
    let ctx = common::context(4);
    let stage = ctx.item_collection::<(u32, u32), u64>("stage");
    let tags = ctx.tag_collection::<u32>("rows");

    let items = stage.clone();
    let step = ctx.step_collection("advance", move |row: &u32, cx: &mut StepCx| -> StepResult {
        let first = cx.get(&items, &(*row, 0))?;
        for col in 1..10u32 {
            cx.put(&items, (*row, col), first + u64::from(col));
        }
        Ok(())
    });
    tags.prescribes(&step).unwrap();

    for row in 0..16 {
        tags.put(row);
    }
    for row in (0..16).rev() {
        stage.put((row, 0), u64::from(row));
    }
    ctx.wait();

    for row in 0..16u32 {
        assert_eq!(stage.try_get(&(row, 9)), Some(u64::from(row) + 9));
    }
}

#[test]
fn range_element_waits_without_rerunning_the_others() {
    let ctx = common::context(4);
    let late = ctx.item_collection::<u32, u64>("late");
    let done = ctx.item_collection::<u32, u64>("done");
    let tags = ctx.tag_collection::<u32>("elements");
    let completions: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(vec![0; 100]));

    let (src, out, counts) = (late.clone(), done.clone(), completions.clone());
    let step = ctx.step_collection("element", move |t: &u32, cx: &mut StepCx| -> StepResult {
        let v = if *t == 37 { cx.get(&src, &37)? } else { u64::from(*t) };
        counts.lock()[*t as usize] += 1;
        cx.put(&out, *t, v);
        Ok(())
    });
    tags.prescribes(&step).unwrap();

    let feeder = Arc::new(ActivityFlag::new("feeder", true));
    ctx.register_hidden_graph(feeder.clone());
    let producer = {
        let (late, feeder) = (late.clone(), feeder.clone());
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            late.put(37, 3700);
            feeder.set_active(false);
        })
    };

    tags.put_range(0u32..100);
    ctx.wait();
    producer.join().unwrap();

    assert_eq!(done.len(), 100);
    assert_eq!(done.try_get(&37), Some(3700));
    assert_eq!(done.try_get(&36), Some(36));
    assert!(completions.lock().iter().all(|&n| n == 1));
    assert!(ctx.unfinished().is_empty());
}

#[test]
fn blocked_ranges_hand_whole_pieces_to_the_step() {
    let ctx = common::context(4);
    let tags = ctx.tag_collection_with::<Blocked<std::ops::Range<u64>>, _>(
        "blocks",
        tuplex_rt::TagSettings {
            memoize: true,
            grain: Some(Grain::Fixed(100)),
        },
    );
    let total = Arc::new(AtomicUsize::new(0));
    let pieces = Arc::new(AtomicUsize::new(0));

    let (sum, count) = (total.clone(), pieces.clone());
    let step = ctx.step_collection(
        "sum",
        move |block: &Blocked<std::ops::Range<u64>>, _: &mut StepCx| -> StepResult {
            assert!(block.0.end - block.0.start <= 100);
            let s: u64 = block.0.clone().sum();
            sum.fetch_add(s as usize, Ordering::SeqCst);
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    );
    tags.prescribes(&step).unwrap();

    tags.put_range(Blocked(0u64..1000));
    ctx.wait();

    assert_eq!(total.load(Ordering::SeqCst), (0..1000).sum::<usize>());
    assert!(pieces.load(Ordering::SeqCst) >= 10);
}

struct EvenTagsAlone;

impl StepTuner<u32> for EvenTagsAlone {
    fn sequentialize(&self, tag: &u32) -> bool {
        tag % 2 == 0
    }
}

#[test]
fn sequentialized_instances_run_alone() {
    let ctx = common::context(4);
    let tags = ctx.tag_collection::<u32>("tags");
    let running = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicUsize::new(0));
    let ran = Arc::new(AtomicUsize::new(0));

    let (now, bad, total) = (running.clone(), overlapped.clone(), ran.clone());
    let step = ctx.step_collection_with(
        "maybe-alone",
        move |t: &u32, _: &mut StepCx| -> StepResult {
            let others = now.fetch_add(1, Ordering::SeqCst);
            if t % 2 == 0 && others != 0 {
                bad.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(1));
            now.fetch_sub(1, Ordering::SeqCst);
            total.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        EvenTagsAlone,
    );
    tags.prescribes(&step).unwrap();

    for t in 0..20 {
        tags.put(t);
    }
    ctx.wait();

    assert_eq!(ran.load(Ordering::SeqCst), 20);
    assert_eq!(overlapped.load(Ordering::SeqCst), 0);
}

struct Cancelable {
    canceled: Arc<CancelSet<u32>>,
}

impl StepTuner<u32> for Cancelable {
    fn was_canceled(&self, tag: &u32) -> bool {
        self.canceled.is_canceled(tag)
    }
}

#[test]
fn canceled_instances_skip_their_body() {
    let ctx = common::context(2);
    let tags = ctx.tag_collection::<u32>("tags");
    let seen = ctx.item_collection::<u32, ()>("seen");
    let canceled = Arc::new(CancelSet::new());
    canceled.cancel(3);

    let out = seen.clone();
    let step = ctx.step_collection_with(
        "work",
        move |t: &u32, cx: &mut StepCx| -> StepResult {
            cx.put(&out, *t, ());
            Ok(())
        },
        Cancelable {
            canceled: canceled.clone(),
        },
    );
    tags.prescribes(&step).unwrap();

    for t in 0..6 {
        tags.put(t);
    }
    ctx.wait();
    assert_eq!(seen.len(), 5);
    assert_eq!(seen.try_get(&3), None);

    canceled.cancel_all();
    tags.put(6);
    ctx.wait();
    assert_eq!(seen.try_get(&6), None);
    assert_eq!(ctx.stats().completed, 7);
}

#[test]
fn wait_returns_only_after_hidden_graphs_go_idle() {
    let ctx = common::context(2);
    let flag = Arc::new(ActivityFlag::new("external", true));
    ctx.register_hidden_graph(flag.clone());

    let setter = {
        let flag = flag.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            flag.set_active(false);
        })
    };
    let start = std::time::Instant::now();
    ctx.wait();
    assert!(start.elapsed() >= Duration::from_millis(30));
    setter.join().unwrap();
}

#[test]
fn step_context_reports_the_current_activation() {
    let ctx = common::context(1);
    let tags = ctx.tag_collection::<u32>("tags");
    let input = ctx.item_collection::<u32, u32>("input");
    let report = ctx.item_collection::<u32, (String, u32, u32)>("report");
    input.put(1, 1);

    let (src, out) = (input.clone(), report.clone());
    let step = ctx.step_collection("probe", move |t: &u32, cx: &mut StepCx| -> StepResult {
        let _ = cx.get(&src, t)?;
        let current = cx.current();
        cx.put(&out, *t, (current.step, current.gets, current.puts));
        Ok(())
    });
    tags.prescribes(&step).unwrap();

    tags.put(1);
    ctx.wait();
    assert_eq!(report.try_get(&1), Some(("probe".to_string(), 1, 0)));
}

#[test]
fn range_with_some_sequential_elements_runs_those_alone() {
    let ctx = common::context(4);
    let tags = ctx.tag_collection::<u32>("tags");
    let running = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicUsize::new(0));
    let completions: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(vec![0; 40]));

    let (now, bad, counts) = (running.clone(), overlapped.clone(), completions.clone());
    let step = ctx.step_collection_with(
        "maybe-alone",
        move |t: &u32, _: &mut StepCx| -> StepResult {
            let others = now.fetch_add(1, Ordering::SeqCst);
            if t % 2 == 0 && others != 0 {
                bad.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(1));
            now.fetch_sub(1, Ordering::SeqCst);
            counts.lock()[*t as usize] += 1;
            Ok(())
        },
        EvenTagsAlone,
    );
    tags.prescribes(&step).unwrap();

    tags.put_range(0u32..40);
    ctx.wait();

    assert!(completions.lock().iter().all(|&n| n == 1));
    assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    assert!(ctx.stats().sequentialized >= 1);
    assert!(ctx.unfinished().is_empty());
}

#[test]
fn range_elements_wait_for_declared_inputs() {
    let ctx = common::context(4);
    let input = ctx.item_collection::<u32, u64>("input");
    let output = ctx.item_collection::<u32, u64>("output");
    let tags = ctx.tag_collection::<u32>("tags");
    let completions: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(vec![0; 64]));

    let (src, out, counts) = (input.clone(), output.clone(), completions.clone());
    let step = ctx.step_collection_with(
        "double",
        move |t: &u32, cx: &mut StepCx| -> StepResult {
            let v = cx.get(&src, t)?;
            cx.put(&out, *t, v * 2);
            counts.lock()[*t as usize] += 1;
            Ok(())
        },
        NeedsInput { input: input.clone() },
    );
    tags.prescribes(&step).unwrap();

    // Odd inputs exist up front; even ones only arrive after the range.
    for t in (1..64u32).step_by(2) {
        input.put(t, u64::from(t));
    }
    tags.put_range(0u32..64);
    for t in (0..64u32).step_by(2).rev() {
        input.put(t, u64::from(t));
    }
    ctx.wait();

    for t in 0..64u32 {
        assert_eq!(output.try_get(&t), Some(u64::from(t) * 2));
    }
    assert!(completions.lock().iter().all(|&n| n == 1));
    assert!(ctx.unfinished().is_empty());
}

struct Unchecked {
    consulted: Arc<AtomicUsize>,
}

impl StepTuner<u32> for Unchecked {
    fn depends(&self, _tag: &u32, _deps: &mut Dependencies) {
        self.consulted.fetch_add(1, Ordering::SeqCst);
    }

    fn check_deps(&self) -> bool {
        false
    }
}

#[test]
fn unchecked_dependencies_run_range_elements_eagerly() {
    let ctx = common::context(4);
    let input = ctx.item_collection::<u32, u64>("input");
    let output = ctx.item_collection::<u32, u64>("output");
    let tags = ctx.tag_collection::<u32>("tags");
    let consulted = Arc::new(AtomicUsize::new(0));

    let (src, out) = (input.clone(), output.clone());
    let step = ctx.step_collection_with(
        "copy",
        move |t: &u32, cx: &mut StepCx| -> StepResult {
            let v = cx.get(&src, t)?;
            cx.put(&out, *t, v);
            Ok(())
        },
        Unchecked {
            consulted: consulted.clone(),
        },
    );
    tags.prescribes(&step).unwrap();

    tags.put_range(0u32..32);
    for t in 0..32u32 {
        input.put(t, u64::from(t) + 100);
    }
    ctx.wait();

    assert_eq!(consulted.load(Ordering::SeqCst), 0);
    for t in 0..32u32 {
        assert_eq!(output.try_get(&t), Some(u64::from(t) + 100));
    }
    assert!(ctx.unfinished().is_empty());
}

#[test]
fn range_without_progress_is_retried_from_pending() {
    let ctx = common::context(2);
    let tags = ctx.tag_collection::<u32>("tags");
    let attempts = Arc::new(AtomicUsize::new(0));
    let completions: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(vec![0; 10]));

    let (tries, counts) = (attempts.clone(), completions.clone());
    let step = ctx.step_collection("flaky", move |t: &u32, _: &mut StepCx| -> StepResult {
        // Nothing is registered, so only a retry can bring element 5 back.
        if *t == 5 && tries.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(NotReady.into());
        }
        counts.lock()[*t as usize] += 1;
        Ok(())
    });
    tags.prescribes(&step).unwrap();

    tags.put_range(0u32..10);
    ctx.wait();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(completions.lock().iter().all(|&n| n == 1));
    assert!(ctx.stats().extra_wakes >= 1);
    assert!(ctx.unfinished().is_empty());
}

#[test]
fn pending_instances_are_retried_while_a_hidden_graph_is_active() {
    let ctx = common::context(2);
    let flag = Arc::new(ActivityFlag::new("cleared-by-step", true));
    ctx.register_hidden_graph(flag.clone());
    let tags = ctx.tag_collection::<u32>("tags");
    let calls = Arc::new(AtomicUsize::new(0));

    let (seen, done) = (calls.clone(), flag.clone());
    let step = ctx.step_collection("release", move |_: &u32, _: &mut StepCx| -> StepResult {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(NotReady.into());
        }
        done.set_active(false);
        Ok(())
    });
    tags.prescribes(&step).unwrap();

    tags.put(1);
    ctx.wait();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!flag.is_active());
    assert!(ctx.unfinished().is_empty());
}
