//! End-to-end scenarios from spec §8, driven entirely in-process through
//! [`Router`]/[`Registries`] — no socket required, since
//! [`Router::dispatch`] and [`Source::send_frame`] are the same code
//! path a real connection drives.

use std::sync::Arc;
use std::time::Duration;

use svr::options::Options;
use svr::router::{Registries, Router};
use svr::{
    DropPolicy, FrameProperties, RawFrame, ReencoderKind, SampleDepth, SourceKind, StreamState,
};

fn props() -> FrameProperties {
    FrameProperties::new(4, 4, SampleDepth::U8, 1)
}

fn frame(n: u8) -> RawFrame {
    RawFrame::new(props(), Arc::new(vec![n; props().frame_byte_size()]))
}

/// Scenario 1: source and stream share an encoding -> `DirectCopy`,
/// subscriber receives byte-identical frames.
#[test]
fn scenario_direct_copy_delivers_byte_identical_frames() {
    let router = Router::new(Arc::new(Registries::new()));
    let r = router.registries();
    let source = r.sources.open("cam", SourceKind::Server).unwrap();
    source.set_encoding("raw", &r.codecs).unwrap();

    let raw = r.codecs.get("raw").unwrap();
    let opts = Options::parse("raw").unwrap();
    let stream = r.streams.open(1, "cam", raw, opts, DropPolicy::default());
    source.attach_stream(stream.id());

    for n in 0..10u8 {
        source.send_frame(frame(n), &r.streams, &r.natives).unwrap();
        let queued = stream.try_recv().expect("chunk enqueued synchronously by deliver()");
        assert_eq!(queued.bytes.as_ref(), vec![n; props().frame_byte_size()].as_slice());
        assert!(queued.is_boundary);
    }
    assert_eq!(stream.reencoder_kind(), Some(ReencoderKind::DirectCopy));
}

/// Scenario 2: stream requests a different encoding than the source ->
/// `DecodeEncode`, subscriber receives the re-encoded (here: still raw,
/// since the crate's only two built-in codecs are `raw` and
/// `mjpeg_passthrough`) bytes of the right size.
#[test]
fn scenario_decode_encode_selected_for_differing_options() {
    let router = Router::new(Arc::new(Registries::new()));
    let r = router.registries();
    let source = r.sources.open("cam", SourceKind::Server).unwrap();
    source.set_encoding("raw:x=1", &r.codecs).unwrap();

    let raw = r.codecs.get("raw").unwrap();
    let requested = Options::parse("raw:x=2").unwrap();
    let stream = r.streams.open(1, "cam", raw, requested, DropPolicy::default());
    source.attach_stream(stream.id());

    source.send_frame(frame(7), &r.streams, &r.natives).unwrap();
    let queued = stream.try_recv().expect("chunk enqueued synchronously by deliver()");
    assert_eq!(queued.bytes.len(), props().frame_byte_size());
    assert_eq!(stream.reencoder_kind(), Some(ReencoderKind::DecodeEncode));
}

/// Scenario 3: the source's encoding changes mid-stream; the stream's
/// reencoder observes the change and rebuilds lazily on the very next
/// delivery, without dropping that frame.
#[test]
fn scenario_mid_stream_encoding_change_rebuilds_reencoder_once() {
    let router = Router::new(Arc::new(Registries::new()));
    let r = router.registries();
    let source = r.sources.open("cam", SourceKind::Server).unwrap();
    source.set_encoding("raw", &r.codecs).unwrap();

    let raw = r.codecs.get("raw").unwrap();
    let opts = Options::parse("raw").unwrap();
    let stream = r.streams.open(1, "cam", raw, opts, DropPolicy::default());
    source.attach_stream(stream.id());

    source.send_frame(frame(1), &r.streams, &r.natives).unwrap();
    stream.try_recv().expect("chunk enqueued synchronously by deliver()");
    assert_eq!(stream.reencoder_kind(), Some(ReencoderKind::DirectCopy));

    // mid-stream: source switches to a stand-in "other" encoding.
    source.set_encoding("mjpeg_passthrough", &r.codecs).unwrap();
    source.send_frame(frame(2), &r.streams, &r.natives).unwrap();
    let queued = stream.try_recv().expect("chunk enqueued synchronously by deliver()");
    assert_eq!(queued.bytes.len(), props().frame_byte_size());
    assert_eq!(stream.reencoder_kind(), Some(ReencoderKind::DecodeEncode));
}

/// Scenario 4: a frame whose shape differs from the pinned properties
/// is rejected and never forwarded.
#[test]
fn scenario_shape_mismatch_rejected_and_not_forwarded() {
    let router = Router::new(Arc::new(Registries::new()));
    let r = router.registries();
    let source = r.sources.open("cam", SourceKind::Server).unwrap();
    source.set_encoding("raw", &r.codecs).unwrap();
    source.set_frame_properties(props()).unwrap();

    let raw = r.codecs.get("raw").unwrap();
    let opts = Options::parse("raw").unwrap();
    let stream = r.streams.open(1, "cam", raw, opts, DropPolicy::default());
    source.attach_stream(stream.id());

    let wrong = FrameProperties::new(8, 8, SampleDepth::U8, 1);
    let bad = RawFrame::new(wrong, Arc::new(vec![0u8; wrong.frame_byte_size()]));
    let err = source.send_frame(bad, &r.streams, &r.natives).unwrap_err();
    assert!(matches!(err, svr::Error::InvalidArgument(_)));
    assert!(stream.queue_is_empty());
}

/// Scenario 6: `Source.getSourcesList` reports the union of all source
/// names with their kind prefix; order is unspecified, set equality is
/// the contract.
#[test]
fn scenario_get_sources_list_reports_set_equality() {
    let router = Router::new(Arc::new(Registries::new()));
    let r = router.registries();
    r.sources.open("a", SourceKind::Client(1)).unwrap();
    r.sources.open("b", SourceKind::Server).unwrap();
    r.sources.open("c", SourceKind::Client(2)).unwrap();

    let mut list = r.sources.list();
    list.sort();
    assert_eq!(
        list,
        vec!["c:a".to_string(), "c:c".to_string(), "s:b".to_string()]
    );
}

/// §8 invariant: after a client disconnects, every source/stream it
/// owned is gone from the registries, including attached streams on
/// server-owned sources that the client merely subscribed to.
#[test]
fn no_leaked_sources_or_streams_after_client_release() {
    let router = Router::new(Arc::new(Registries::new()));
    let r = router.registries();
    r.sources.open("cam", SourceKind::Client(5)).unwrap();
    let raw = r.codecs.get("raw").unwrap();
    let opts = Options::parse("raw").unwrap();
    r.streams.open(5, "cam", raw, opts, DropPolicy::default());

    assert_eq!(r.sources.len(), 1);
    assert_eq!(r.streams.len(), 1);
    router.release_client(5);
    assert!(r.sources.is_empty());
    assert!(r.streams.is_empty());
}

/// §8's lock-order freedom-from-deadlock property, covered here as a
/// stress test rather than a model-checked search (no model checker
/// dependency appears elsewhere in this corpus): many threads hammer
/// the same source/stream registries concurrently and the test simply
/// has to finish within its timeout.
#[test]
fn concurrent_verb_interleaving_terminates() {
    let router = Arc::new(Router::new(Arc::new(Registries::new())));
    {
        let r = router.registries();
        let source = r.sources.open("cam", SourceKind::Server).unwrap();
        source.set_encoding("raw", &r.codecs).unwrap();
    }

    let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut handles = Vec::new();
    for client_id in 0..8u64 {
        let router = router.clone();
        let done = done.clone();
        handles.push(std::thread::spawn(move || {
            let r = router.registries();
            let raw = r.codecs.get("raw").unwrap();
            let opts = Options::parse("raw").unwrap();
            for _ in 0..50 {
                let stream = r.streams.open(client_id, "cam", raw.clone(), opts.clone(), DropPolicy::default());
                if let Some(source) = r.sources.get("cam") {
                    source.attach_stream(stream.id());
                    let _ = source.send_frame(frame(1), &r.streams, &r.natives);
                }
                stream.pause();
                stream.resume();
                let _ = r.streams.close(stream.id());
            }
            done.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    for handle in handles {
        handle.join().expect("worker thread panicked");
    }
    assert!(std::time::Instant::now() < deadline, "stress test did not terminate in time");
    assert_eq!(done.load(std::sync::atomic::Ordering::SeqCst), 8);
}

/// A paused stream observes `Paused`; orphaning after its source closes
/// transitions to `Orphaned` without the subscriber having closed it.
#[test]
fn pause_and_orphan_state_transitions_are_observable() {
    let router = Router::new(Arc::new(Registries::new()));
    let r = router.registries();
    let source = r.sources.open("cam", SourceKind::Server).unwrap();
    source.set_encoding("raw", &r.codecs).unwrap();
    let raw = r.codecs.get("raw").unwrap();
    let opts = Options::parse("raw").unwrap();
    let stream = r.streams.open(1, "cam", raw, opts, DropPolicy::default());
    source.attach_stream(stream.id());

    stream.pause();
    assert_eq!(stream.state(), StreamState::Paused);
    stream.resume();
    assert_eq!(stream.state(), StreamState::Flowing);

    r.sources.close("cam", &r.streams).unwrap();
    assert_eq!(stream.state(), StreamState::Orphaned);
}
