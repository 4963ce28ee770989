mod common;

use std::sync::Arc;

use tuplex_rt::{
    Config, ConsumedOn, Context, DistError, ItemCollection, LoopbackNetwork, Message, MessageKind,
    Placement, StepCx, StepResult, StepTuner, TagCollection, Topology,
};

struct ByParity;

impl StepTuner<u32> for ByParity {
    fn compute_on(&self, tag: &u32, _topology: &Topology) -> Placement {
        Placement::Process(tag % 2)
    }
}

type Results = ItemCollection<u32, u32, ConsumedOn<u32>>;

/// Builds the same graph on every process, so collection ids line up.
fn wire(ctx: &Context) -> (TagCollection<u32>, Results) {
    let tags = ctx.tag_collection::<u32>("work");
    let results: Results = ctx.item_collection_with("results", ConsumedOn::new(0));

    let out = results.clone();
    let step = ctx.step_collection_with(
        "where",
        move |t: &u32, cx: &mut StepCx| -> StepResult {
            let here = cx.topology().local;
            cx.put(&out, *t, here);
            Ok(())
        },
        ByParity,
    );
    tags.prescribes(&step).unwrap();
    (tags, results)
}

fn process(network: &Arc<LoopbackNetwork>, p: u32) -> Context {
    let config = Config {
        num_threads: 2,
        ..Config::default()
    };
    let ctx = Context::builder()
        .config(config)
        .ignore_env()
        .transport(network.endpoint(p))
        .build()
        .unwrap();
    network.attach(&ctx);
    ctx
}

#[test]
fn instances_run_where_their_tuner_places_them() {
    common::init_logging();
    let network = LoopbackNetwork::new(2);
    let p0 = process(&network, 0);
    let p1 = process(&network, 1);
    let (tags, results) = wire(&p0);
    let (_, remote_results) = wire(&p1);

    for t in 0..10 {
        tags.put(t);
    }
    network.wait_all();

    assert!(network.take_errors().is_empty());
    assert_eq!(results.len(), 10);
    for t in 0..10u32 {
        assert_eq!(results.try_get(&t), Some(t % 2), "tag {t}");
        assert_eq!(results.owner(&t), Some(t % 2), "owner of {t}");
    }
    assert_eq!(results.owner(&10), None);
    assert!(remote_results.is_empty());
    assert_eq!(p0.stats().remote, 5);
    assert_eq!(p1.stats().completed, 5);
}

#[test]
fn messages_for_unknown_collections_are_rejected() {
    let ctx = common::context(1);
    let tags = ctx.tag_collection::<u32>("tags");

    let bogus = Message::control(tags.id(), MessageKind::Launch);
    assert!(matches!(
        ctx.receive_message(&bogus),
        Err(DistError::UnexpectedKind { .. })
    ));

    let wrong_payload = Message::new(tags.id(), MessageKind::PutTag, "not a u32");
    assert!(matches!(
        ctx.receive_message(&wrong_payload),
        Err(DistError::PayloadMismatch { .. })
    ));

    let replayed = Message::new(tags.id(), MessageKind::PutTag, 4u32);
    ctx.receive_message(&replayed).unwrap();
    assert_eq!(tags.tags(), vec![4]);
}

#[test]
fn single_process_topology_keeps_everything_local() {
    let ctx = common::context(1);
    let topology = ctx.topology();
    assert_eq!(topology, Topology::single());
    assert!(topology.is_local(Placement::Process(0)));
    assert!(topology.is_local(Placement::All));
}
