use std::fmt;

/// A unit of work submitted to a [`WorkerPool`](crate::WorkerPool).
///
/// Priority and affinity are hints: jobs with `priority > 0` are served from
/// the urgent queue before ordinary work, and a job with an affinity is
/// delivered to that worker's mailbox instead of the shared queues.
pub struct Job {
    pub priority: i32,
    pub affinity: Option<usize>,
    task: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Job {
            priority: 0,
            affinity: None,
            task: Box::new(task),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_affinity(mut self, affinity: Option<usize>) -> Self {
        self.affinity = affinity;
        self
    }

    /// Consumes the job and runs it on the calling thread.
    #[inline]
    pub fn run(self) {
        (self.task)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("priority", &self.priority)
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}
