//! Adapter state transitions racing the data plane.

mod harness;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use harness::packets::{echo, parse_exchange};
use harness::{RecordingStack, running_adapter};
use mvirt_tun::exchange::EXCH_MIN_BUFFER_SIZE_READ;
use mvirt_tun::{
    Adapter, AdapterConfig, AdapterError, AdapterRegistry, AdapterState, Batch, BatchStatus,
    MediaConnectState, PauseStatus, PowerState,
};

#[test]
fn test_pause_waits_for_in_flight_send() {
    let _ = tracing_subscriber::fmt::try_init();
    let (adapter, stack, consumer) = running_adapter(16);

    let pending = consumer.read(EXCH_MIN_BUFFER_SIZE_READ).unwrap();
    let gate = stack.gate_release(1);

    // The batch is delivered to the pending read and released from inside
    // the submit call, where the gate holds it.
    let sender = {
        let adapter = Arc::clone(&adapter);
        thread::spawn(move || adapter.submit([Batch::single(echo(1)).with_tag(1)]))
    };
    gate.entered
        .recv_timeout(Duration::from_secs(5))
        .expect("release entered");

    let paused = Arc::new(AtomicBool::new(false));
    let pauser = {
        let adapter = Arc::clone(&adapter);
        let paused = Arc::clone(&paused);
        thread::spawn(move || {
            let status = adapter.pause();
            paused.store(true, Ordering::SeqCst);
            status
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!paused.load(Ordering::SeqCst));
    assert_eq!(adapter.state(), AdapterState::Running);

    gate.proceed.send(()).unwrap();
    sender.join().unwrap();
    let status = pauser.join().unwrap().unwrap();

    assert_eq!(status, PauseStatus::Complete);
    assert_eq!(adapter.state(), AdapterState::Paused);
    assert_eq!(stack.released(), vec![(1, BatchStatus::Success)]);
    // Completed synchronously once the send left, no callback.
    assert_eq!(stack.pause_completions(), 0);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let buf = runtime.block_on(pending).unwrap();
    assert_eq!(parse_exchange(&buf), vec![echo(1)]);
}

#[test]
fn test_low_power_flushes_sends_already_admitted() {
    let _ = tracing_subscriber::fmt::try_init();
    let (adapter, stack, _consumer) = running_adapter(16);
    let gate = stack.gate_release(100);

    // The empty batch is released inside submit, after the power check and
    // before batch 1 is queued.
    let sender = {
        let adapter = Arc::clone(&adapter);
        thread::spawn(move || {
            adapter.submit([
                Batch::new(Vec::new()).with_tag(100),
                Batch::single(echo(1)).with_tag(1),
            ])
        })
    };
    gate.entered
        .recv_timeout(Duration::from_secs(5))
        .expect("release entered");

    let power = {
        let adapter = Arc::clone(&adapter);
        thread::spawn(move || adapter.set_power_state(PowerState::D3))
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(adapter.power(), PowerState::D0);

    gate.proceed.send(()).unwrap();
    sender.join().unwrap();
    power.join().unwrap();

    assert_eq!(adapter.power(), PowerState::D3);
    assert_eq!(adapter.queued_batches(), 0);
    assert_eq!(
        stack.released(),
        vec![(100, BatchStatus::Success), (1, BatchStatus::LowPower)]
    );
}

#[test]
fn test_last_consumer_detach_waits_for_in_flight_send() {
    let _ = tracing_subscriber::fmt::try_init();
    let (adapter, stack, consumer) = running_adapter(16);
    let gate = stack.gate_release(100);

    let sender = {
        let adapter = Arc::clone(&adapter);
        thread::spawn(move || {
            adapter.submit([
                Batch::new(Vec::new()).with_tag(100),
                Batch::single(echo(1)).with_tag(1),
            ])
        })
    };
    gate.entered
        .recv_timeout(Duration::from_secs(5))
        .expect("release entered");

    let detach = thread::spawn(move || drop(consumer));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(adapter.consumers(), 1);

    gate.proceed.send(()).unwrap();
    sender.join().unwrap();
    detach.join().unwrap();

    assert_eq!(adapter.consumers(), 0);
    assert_eq!(adapter.queued_batches(), 0);
    assert_eq!(
        stack.released(),
        vec![(100, BatchStatus::Success), (1, BatchStatus::Aborted)]
    );
    assert_eq!(stack.links().last(), Some(&MediaConnectState::Disconnected));
}

#[tokio::test]
async fn test_pause_flushes_queue_and_rejects_sends() {
    let _ = tracing_subscriber::fmt::try_init();
    let (adapter, stack, _consumer) = running_adapter(16);

    adapter.submit([Batch::single(echo(1)).with_tag(1)]);
    assert_eq!(adapter.pause().unwrap(), PauseStatus::Complete);
    assert_eq!(stack.released_with(BatchStatus::Paused), vec![1]);

    adapter.submit([Batch::single(echo(2)).with_tag(2)]);
    assert_eq!(stack.released_with(BatchStatus::Paused), vec![1, 2]);
    assert_eq!(adapter.queued_batches(), 0);

    assert!(matches!(
        adapter.pause(),
        Err(AdapterError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_read_pends_across_pause_and_restart() {
    let _ = tracing_subscriber::fmt::try_init();
    let (adapter, _stack, consumer) = running_adapter(16);

    adapter.pause().unwrap();
    let pending = consumer.read(EXCH_MIN_BUFFER_SIZE_READ).unwrap();
    assert_eq!(adapter.pending_reads(), 1);

    adapter.restart().unwrap();
    adapter.submit([Batch::single(echo(5))]);

    let buf = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("read completed")
        .unwrap();
    assert_eq!(parse_exchange(&buf), vec![echo(5)]);
}

#[tokio::test]
async fn test_halt_fails_pending_reads() {
    let _ = tracing_subscriber::fmt::try_init();
    let (adapter, stack, consumer) = running_adapter(16);

    let first = consumer.read(EXCH_MIN_BUFFER_SIZE_READ).unwrap();
    let second = consumer.read(EXCH_MIN_BUFFER_SIZE_READ).unwrap();
    adapter.halt().unwrap();

    assert!(matches!(
        first.await,
        Err(AdapterError::ForcedClosed(AdapterState::Halting))
    ));
    assert!(matches!(
        second.await,
        Err(AdapterError::ForcedClosed(AdapterState::Halting))
    ));
    assert_eq!(adapter.state(), AdapterState::Halted);
    assert_eq!(adapter.power(), PowerState::Unspecified);

    assert!(matches!(
        consumer.read(EXCH_MIN_BUFFER_SIZE_READ),
        Err(AdapterError::ForcedClosed(AdapterState::Halted))
    ));
    drop(consumer);
    assert_eq!(stack.links().last(), Some(&MediaConnectState::Disconnected));
}

#[tokio::test]
async fn test_halt_aborts_queued_batches() {
    let _ = tracing_subscriber::fmt::try_init();
    let (adapter, stack, _consumer) = running_adapter(16);

    adapter.submit((1..=3u64).map(|tag| Batch::single(echo(tag as u16)).with_tag(tag)));
    adapter.halt().unwrap();

    assert_eq!(stack.released_with(BatchStatus::Aborted), vec![1, 2, 3]);
    assert_eq!(adapter.queued_batches(), 0);
}

#[tokio::test]
async fn test_open_requires_initialized_adapter() {
    let _ = tracing_subscriber::fmt::try_init();
    let stack = Arc::new(RecordingStack::default());
    let adapter = Adapter::new("tun-test", 16, stack.clone());

    assert!(matches!(
        adapter.open(),
        Err(AdapterError::DeletePending(AdapterState::Halted))
    ));

    adapter.initialize().unwrap();
    assert_eq!(adapter.state(), AdapterState::Paused);
    assert_eq!(adapter.power(), PowerState::D0);

    let consumer = adapter.open().unwrap();
    assert_eq!(adapter.consumers(), 1);
    assert_eq!(
        stack.links(),
        vec![MediaConnectState::Disconnected, MediaConnectState::Connected]
    );
    drop(consumer);
    assert_eq!(adapter.consumers(), 0);
}

#[tokio::test]
async fn test_reinitialize_after_halt() {
    let _ = tracing_subscriber::fmt::try_init();
    let (adapter, _stack, consumer) = running_adapter(16);
    drop(consumer);

    adapter.halt().unwrap();
    adapter.initialize().unwrap();
    let consumer = adapter.open().unwrap();
    adapter.restart().unwrap();

    let pending = consumer.read(EXCH_MIN_BUFFER_SIZE_READ).unwrap();
    adapter.submit([Batch::single(echo(9))]);
    let buf = pending.await.unwrap();
    assert_eq!(parse_exchange(&buf), vec![echo(9)]);
}

#[tokio::test]
async fn test_shutdown_is_terminal() {
    let _ = tracing_subscriber::fmt::try_init();
    let stack = Arc::new(RecordingStack::default());
    let adapter = Adapter::new("tun-test", 16, stack);

    adapter.shutdown().unwrap();
    assert_eq!(adapter.state(), AdapterState::Shutdown);
    assert!(adapter.initialize().is_err());
    assert!(adapter.halt().is_err());
}

#[tokio::test]
async fn test_registry_lifecycle() {
    let _ = tracing_subscriber::fmt::try_init();
    let registry = AdapterRegistry::new();
    let stack = Arc::new(RecordingStack::default());

    let config = AdapterConfig::default().with_name("tun-a");
    let adapter = registry.create(&config, stack.clone()).unwrap();
    assert_eq!(adapter.state(), AdapterState::Paused);
    assert!(matches!(
        registry.create(&config, stack.clone()),
        Err(AdapterError::NameInUse(_))
    ));

    let unnamed = registry.create(&AdapterConfig::default(), stack).unwrap();
    assert_eq!(registry.len(), 2);
    assert!(
        registry
            .find_by_name(unnamed.name())
            .is_some_and(|found| found.id() == unnamed.id())
    );

    registry.remove(adapter.id()).unwrap();
    assert_eq!(adapter.state(), AdapterState::Halted);
    assert!(registry.get(adapter.id()).is_none());

    registry.halt_all();
    assert!(registry.is_empty());
    assert_eq!(unnamed.state(), AdapterState::Halted);
}
