use anyhow::{anyhow, Context, Result};
use std::thread::{self, JoinHandle};

// Frame-scoped producer handles; the orchestrator joins them all before it
// reads anything the producers wrote.
#[derive(Default)]
pub struct ProducerJoinSet {
    handles: Vec<JoinHandle<Result<()>>>,
}

impl ProducerJoinSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let name = format!("crowd-producer-{}", self.handles.len());
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(task)
            .with_context(|| format!("Failed to spawn producer thread '{name}'"))?;
        self.handles.push(handle);
        Ok(())
    }

    pub fn add(&mut self, handle: JoinHandle<Result<()>>) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    // Joins every handle even when one fails, then reports the first error.
    pub fn wait_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("crowd-producer").to_string();
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err.context(format!("Producer thread '{name}' failed")));
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(anyhow!("Producer thread '{name}' panicked"));
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn wait_all_joins_every_producer() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut set = ProducerJoinSet::new();
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            set.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("spawn");
        }
        assert_eq!(set.len(), 3);
        set.wait_all().expect("all producers succeed");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(set.is_empty());
    }

    #[test]
    fn failing_producer_surfaces_its_name() {
        let mut set = ProducerJoinSet::new();
        set.spawn(|| Ok(())).expect("spawn");
        set.spawn(|| Err(anyhow!("bad sample"))).expect("spawn");
        let error = set.wait_all().expect_err("failure propagates");
        let message = format!("{error:#}");
        assert!(message.contains("crowd-producer-1"));
        assert!(message.contains("bad sample"));
    }

    #[test]
    fn panicking_producer_becomes_an_error() {
        let mut set = ProducerJoinSet::new();
        set.spawn(|| panic!("boom")).expect("spawn");
        let error = set.wait_all().expect_err("panic propagates");
        assert!(format!("{error}").contains("panicked"));
    }

    #[test]
    fn set_is_reusable_after_wait() {
        let mut set = ProducerJoinSet::new();
        set.spawn(|| Ok(())).expect("spawn");
        set.wait_all().expect("first frame");
        set.spawn(|| Ok(())).expect("spawn");
        set.wait_all().expect("second frame");
    }
}
