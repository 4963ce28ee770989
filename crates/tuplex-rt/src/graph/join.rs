use std::sync::Arc;

use parking_lot::Mutex;

use super::HiddenGraph;
use crate::context::Context;
use crate::tag::TagCollection;
use crate::types::Tag;

/// Cross product of two tag collections, emitted into a collection of pairs.
///
/// Each pair is put exactly once, by whichever side arrives second.
pub struct Join<A: Tag, B: Tag> {
    name: String,
    seen: Mutex<(Vec<A>, Vec<B>)>,
    out: TagCollection<(A, B)>,
}

/// Wires a join of `left` and `right` into `out` and registers it with `ctx`.
pub fn join<A: Tag, B: Tag>(
    ctx: &Context,
    name: impl Into<String>,
    left: &TagCollection<A>,
    right: &TagCollection<B>,
    out: &TagCollection<(A, B)>,
) -> Arc<Join<A, B>> {
    let graph = Arc::new(Join {
        name: name.into(),
        seen: Mutex::new((Vec::new(), Vec::new())),
        out: out.clone(),
    });

    let g = graph.clone();
    left.on_put(move |a: &A| g.left(a.clone()));
    let g = graph.clone();
    right.on_put(move |b: &B| g.right(b.clone()));

    ctx.register_hidden_graph(graph.clone());
    graph
}

impl<A: Tag, B: Tag> Join<A, B> {
    fn left(&self, a: A) {
        let pairs: Vec<(A, B)> = {
            let mut seen = self.seen.lock();
            seen.0.push(a.clone());
            seen.1.iter().map(|b| (a.clone(), b.clone())).collect()
        };
        for pair in pairs {
            self.out.put(pair);
        }
    }

    fn right(&self, b: B) {
        let pairs: Vec<(A, B)> = {
            let mut seen = self.seen.lock();
            seen.1.push(b.clone());
            seen.0.iter().map(|a| (a.clone(), b.clone())).collect()
        };
        for pair in pairs {
            self.out.put(pair);
        }
    }
}

impl<A: Tag, B: Tag> HiddenGraph for Join<A, B> {
    fn name(&self) -> &str {
        &self.name
    }

    // Pairs are put synchronously from the observers.
    fn is_active(&self) -> bool {
        false
    }
}
