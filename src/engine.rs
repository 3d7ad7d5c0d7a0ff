//! The arena of live watchers.
//!
//! The engine ties the pieces together: it parses templates, registers
//! watchers on the [`ChangeBus`], spawns one driver task per watcher and
//! hands every fresh result to a single delivery stream. Watchers are
//! addressed by [`WatcherId`]; cancelling one detaches it from the bus
//! before its task goes away.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::ChangeBus;
use crate::error::Result;
use crate::graph::WatcherId;
use crate::runner::Executor;
use crate::store::ParameterStore;
use crate::template::Template;
use crate::watcher::{drive, Delivery, Watcher};

struct WatcherHandle {
    template: Template,
    task: JoinHandle<()>,
}

pub struct Engine<E> {
    store: ParameterStore,
    bus: ChangeBus,
    executor: Arc<E>,
    watchers: BTreeMap<WatcherId, WatcherHandle>,
    next_id: u64,
    deliveries: mpsc::Sender<Delivery>,
}

impl<E: Executor> Engine<E> {
    /// Creates an engine over `store`. Fresh results arrive on the returned
    /// receiver; `capacity` bounds how many may queue before watchers wait.
    pub fn new(
        store: ParameterStore,
        executor: E,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Delivery>) {
        let (deliveries, rx) = mpsc::channel(capacity.max(1));
        let engine = Self {
            bus: ChangeBus::new(store.clone()),
            store,
            executor: Arc::new(executor),
            watchers: BTreeMap::new(),
            next_id: 0,
            deliveries,
        };
        (engine, rx)
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    pub fn set(&self, name: &str, value: impl Into<String>) -> u64 {
        self.store.set(name, value)
    }

    /// Parses `raw` and starts watching it. The first execution starts
    /// right away.
    ///
    /// A malformed template fails here and leaves the engine untouched.
    pub fn watch(&mut self, raw: &str, listen: &[String]) -> Result<WatcherId> {
        let template = Template::parse(raw)?;
        self.next_id += 1;
        let id = WatcherId(self.next_id);
        let watcher = Watcher::new(id, template.clone(), listen);
        for name in watcher.dependencies() {
            self.store.declare(name);
        }
        // Attach before the first render so no change slips between them.
        let mailbox = self.bus.attach(id, watcher.dependencies());
        let task = tokio::spawn(drive(
            watcher,
            self.store.clone(),
            Arc::clone(&self.executor),
            mailbox,
            self.deliveries.clone(),
        ));
        tracing::info!(watcher = %id, template = %template, "watching");
        self.watchers.insert(id, WatcherHandle { template, task });
        Ok(id)
    }

    /// Stops a watcher. Returns false for unknown ids.
    pub fn cancel(&mut self, id: WatcherId) -> bool {
        let Some(handle) = self.watchers.remove(&id) else {
            return false;
        };
        self.bus.detach(id);
        handle.task.abort();
        tracing::info!(watcher = %id, "cancelled");
        true
    }

    pub fn shutdown(&mut self) {
        let ids: Vec<WatcherId> = self.watchers.keys().copied().collect();
        for id in ids {
            self.cancel(id);
        }
    }

    pub fn dependencies(&self, id: WatcherId) -> Vec<String> {
        self.bus.dependencies_of(id)
    }

    pub fn watchers(&self) -> impl Iterator<Item = (WatcherId, &Template)> {
        self.watchers
            .iter()
            .map(|(id, handle)| (*id, &handle.template))
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }
}

impl<E> Drop for Engine<E> {
    fn drop(&mut self) {
        for handle in self.watchers.values() {
            handle.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use crate::error::Error;
    use crate::runner::{ExecutionOutcome, ExecutionRequest, ExecutionStatus, Supersession};

    /// Completes every command after a short delay, echoing it back.
    #[derive(Clone, Default)]
    struct Recording {
        commands: Arc<Mutex<Vec<String>>>,
    }

    impl Recording {
        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl Executor for Recording {
        fn execute(
            &self,
            request: ExecutionRequest,
            _supersession: Supersession,
        ) -> impl Future<Output = ExecutionOutcome> + Send {
            self.commands.lock().unwrap().push(request.command.clone());
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                ExecutionOutcome::exited(request.command, Some(0))
            }
        }
    }

    type Gate = (String, oneshot::Sender<ExecutionOutcome>, Supersession);

    /// Holds every command until the test completes it.
    struct Gated {
        calls: mpsc::UnboundedSender<Gate>,
    }

    impl Executor for Gated {
        fn execute(
            &self,
            request: ExecutionRequest,
            supersession: Supersession,
        ) -> impl Future<Output = ExecutionOutcome> + Send {
            let (tx, rx) = oneshot::channel();
            let _ = self.calls.send((request.command, tx, supersession));
            async move {
                rx.await
                    .unwrap_or_else(|_| ExecutionOutcome::failed("gate dropped"))
            }
        }
    }

    fn gated() -> (
        (Engine<Gated>, mpsc::Receiver<Delivery>),
        mpsc::UnboundedReceiver<Gate>,
    ) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Engine::new(ParameterStore::new(), Gated { calls }, 16), rx)
    }

    async fn next<T>(rx: &mut mpsc::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    async fn next_call(rx: &mut mpsc::UnboundedReceiver<Gate>) -> Gate {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    async fn quiet<T>(rx: &mut mpsc::Receiver<T>) -> bool {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    }

    /// Waits for deliveries to stop and returns the last one.
    async fn settle(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
        let mut last = next(rx).await;
        while let Ok(Some(delivery)) =
            tokio::time::timeout(Duration::from_millis(300), rx.recv()).await
        {
            last = delivery;
        }
        last
    }

    fn ok(output: &str) -> ExecutionOutcome {
        ExecutionOutcome::exited(output, Some(0))
    }

    #[tokio::test]
    async fn first_render_uses_existing_value_and_identical_set_is_ignored() {
        let recording = Recording::default();
        let (mut engine, mut deliveries) =
            Engine::new(ParameterStore::new(), recording.clone(), 16);
        engine.set("name", "Jim");
        engine.watch("echo {name}", &[]).unwrap();

        let delivery = next(&mut deliveries).await;
        assert_eq!(delivery.command, "echo Jim");
        assert!(delivery.status.success());

        engine.set("name", "Jim");
        assert!(quiet(&mut deliveries).await);
        assert_eq!(recording.commands(), vec!["echo Jim".to_string()]);
    }

    #[tokio::test]
    async fn unset_parameters_render_empty_then_converge() {
        let (mut engine, mut deliveries) =
            Engine::new(ParameterStore::new(), Recording::default(), 16);
        engine.watch("echo {a}-{b}", &[]).unwrap();
        assert_eq!(next(&mut deliveries).await.command, "echo -");

        engine.set("a", "1");
        engine.set("b", "2");
        // Either one or two renders may happen; the last one sees both.
        assert_eq!(settle(&mut deliveries).await.command, "echo 1-2");
    }

    #[tokio::test]
    async fn stale_result_finishing_last_is_never_delivered() {
        let ((mut engine, mut deliveries), mut calls) = gated();
        engine.watch("show {x}", &[]).unwrap();
        let (first_cmd, first, mut first_supersession) = next_call(&mut calls).await;
        assert_eq!(first_cmd, "show ");

        engine.set("x", "1");
        let (second_cmd, second, _) = next_call(&mut calls).await;
        assert_eq!(second_cmd, "show 1");
        tokio::time::timeout(Duration::from_secs(2), first_supersession.superseded())
            .await
            .expect("first execution was not told it is superseded");

        second.send(ok("fresh")).unwrap();
        let delivery = next(&mut deliveries).await;
        assert_eq!(delivery.command, "show 1");
        assert_eq!(delivery.output, "fresh");

        first.send(ok("stale")).unwrap();
        assert!(quiet(&mut deliveries).await);
    }

    #[tokio::test]
    async fn stale_result_finishing_first_is_never_delivered() {
        let ((mut engine, mut deliveries), mut calls) = gated();
        engine.watch("show {x}", &[]).unwrap();
        let (_, first, _) = next_call(&mut calls).await;
        engine.set("x", "1");
        let (_, second, _) = next_call(&mut calls).await;

        first.send(ok("stale")).unwrap();
        assert!(quiet(&mut deliveries).await);
        second.send(ok("fresh")).unwrap();
        assert_eq!(next(&mut deliveries).await.output, "fresh");
    }

    #[tokio::test]
    async fn burst_of_sets_converges_on_the_final_value() {
        let recording = Recording::default();
        let (mut engine, mut deliveries) =
            Engine::new(ParameterStore::new(), recording.clone(), 256);
        engine.watch("echo {n}", &[]).unwrap();
        for n in 0..50 {
            engine.set("n", n.to_string());
        }

        assert_eq!(settle(&mut deliveries).await.command, "echo 49");
        assert!(recording.commands().len() <= 51);
    }

    #[tokio::test]
    async fn failures_are_delivered_and_the_watcher_keeps_going() {
        let ((mut engine, mut deliveries), mut calls) = gated();
        engine.watch("run {x}", &[]).unwrap();
        let (_, first, _) = next_call(&mut calls).await;
        first
            .send(ExecutionOutcome::failed("no such shell"))
            .unwrap();
        let delivery = next(&mut deliveries).await;
        assert_eq!(
            delivery.status,
            ExecutionStatus::Failed {
                error: "no such shell".to_string()
            }
        );

        engine.set("x", "again");
        let (command, second, _) = next_call(&mut calls).await;
        assert_eq!(command, "run again");
        second.send(ExecutionOutcome::exited("", Some(2))).unwrap();
        let delivery = next(&mut deliveries).await;
        assert_eq!(delivery.status, ExecutionStatus::Exited { code: Some(2) });
    }

    #[tokio::test]
    async fn listened_parameters_trigger_reruns() {
        let recording = Recording::default();
        let (mut engine, mut deliveries) =
            Engine::new(ParameterStore::new(), recording.clone(), 16);
        let id = engine.watch("date", &["tick".to_string()]).unwrap();
        assert_eq!(engine.dependencies(id), vec!["tick".to_string()]);
        next(&mut deliveries).await;

        engine.store().touch("tick");
        assert_eq!(next(&mut deliveries).await.execution_id, 2);
    }

    #[tokio::test]
    async fn cancel_unsubscribes_before_teardown() {
        let recording = Recording::default();
        let (mut engine, mut deliveries) =
            Engine::new(ParameterStore::new(), recording.clone(), 16);
        let keep = engine.watch("keep {x}", &[]).unwrap();
        let drop_me = engine.watch("drop {x} {y}", &[]).unwrap();
        next(&mut deliveries).await;
        next(&mut deliveries).await;

        assert!(engine.cancel(drop_me));
        assert!(!engine.cancel(drop_me));
        engine.bus().assert_consistent();
        assert!(engine.bus().watchers_for("y").is_empty());
        assert_eq!(
            engine.bus().watchers_for("x").into_iter().collect::<Vec<_>>(),
            vec![keep]
        );

        engine.set("x", "1");
        let delivery = next(&mut deliveries).await;
        assert_eq!(delivery.watcher, keep);
        assert!(quiet(&mut deliveries).await);
        assert!(!recording.commands().contains(&"drop 1 ".to_string()));
        assert_eq!(engine.watchers().count(), 1);
    }

    #[tokio::test]
    async fn malformed_template_leaves_engine_untouched() {
        let (mut engine, _deliveries) =
            Engine::new(ParameterStore::new(), Recording::default(), 16);
        let err = engine.watch("echo {2x}", &[]).unwrap_err();
        assert!(matches!(err, Error::MalformedTemplate { .. }));
        assert_eq!(engine.watchers().count(), 0);
        assert!(engine.store().get("2x").is_err());
    }

    #[tokio::test]
    async fn watchers_run_independently() {
        let ((mut engine, mut deliveries), mut calls) = gated();
        let slow = engine.watch("slow {x}", &[]).unwrap();
        let fast = engine.watch("fast {x}", &[]).unwrap();
        let mut pending = Vec::new();
        for _ in 0..2 {
            pending.push(next_call(&mut calls).await);
        }
        let (_, fast_gate, _) = pending
            .iter()
            .position(|(cmd, _, _)| cmd.starts_with("fast"))
            .map(|idx| pending.remove(idx))
            .unwrap();
        fast_gate.send(ok("f")).unwrap();
        assert_eq!(next(&mut deliveries).await.watcher, fast);

        let (_, slow_gate, _) = pending.pop().unwrap();
        slow_gate.send(ok("s")).unwrap();
        assert_eq!(next(&mut deliveries).await.watcher, slow);
    }
}
