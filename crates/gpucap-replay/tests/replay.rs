use std::sync::Arc;
use std::time::Duration;

use gpucap_capture::{DeviceChild, WrappedDevice};
use gpucap_driver::{DriverDevice, DriverKind, SoftConfig, SoftDevice};
use gpucap_ipc::{
    CaptureOptions, ClearValue, CompType, EventId, Format, GpuCounter, InitialContents,
    ReplayCommand, ReplayConfig, ReplayEvent, ReplayMode, ReplayState, ResourceId, TextureDesc,
    Triangle, ViewDesc, ViewKind,
};
use gpucap_log::{Call, ChunkLog, ChunkType, ChunkWriter};
use gpucap_replay::{create_controller, CounterRegistry, ReplayError, ReplaySession};

const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

struct Scene {
    log: ChunkLog,
    target: ResourceId,
    draws: Vec<EventId>,
    captured_pixels: Vec<u8>,
}

fn triangle(vertices: [[f32; 2]; 3], color: [f32; 4]) -> Triangle {
    Triangle {
        vertices,
        depth: 0.5,
        color,
    }
}

/// Captures a clear to black followed by one partial draw per triangle.
fn capture_scene(triangles: &[Triangle]) -> Scene {
    let soft = Arc::new(SoftDevice::default());
    let device = WrappedDevice::new(soft.clone(), CaptureOptions::default());
    let target = device
        .create_texture(&TextureDesc::new_2d(4, 4, Format::R8G8B8A8Unorm), None)
        .unwrap();
    let rtv = device
        .create_view(&target, &ViewDesc::new(ViewKind::RenderTarget))
        .unwrap();
    let ctx = device.immediate_context();

    device.begin_capture().unwrap();
    ctx.set_render_targets(&[&rtv], None).unwrap();
    ctx.clear_render_target_view(&rtv, BLACK).unwrap();
    for tri in triangles {
        ctx.draw(std::slice::from_ref(tri)).unwrap();
    }
    let log = device.end_capture().unwrap();

    let native = device.resources().resolve(target.id()).unwrap();
    let captured_pixels = soft
        .immediate_context()
        .read_subresource(native, 0)
        .unwrap()
        .to_vec();
    let draws = log
        .chunks()
        .iter()
        .filter(|c| c.chunk_type == ChunkType::Draw)
        .map(|c| c.event_id)
        .collect();
    Scene {
        log,
        target: target.id(),
        draws,
        captured_pixels,
    }
}

fn three_draws() -> Scene {
    capture_scene(&[
        triangle([[0.0, 0.0], [4.0, 0.0], [0.0, 4.0]], [1.0, 0.0, 0.0, 1.0]),
        triangle([[4.0, 4.0], [0.0, 4.0], [4.0, 0.0]], [0.0, 1.0, 0.0, 1.0]),
        triangle([[0.0, 0.0], [2.0, 0.0], [0.0, 2.0]], [0.0, 0.0, 1.0, 1.0]),
    ])
}

fn open(log: &ChunkLog) -> ReplaySession {
    open_with(log, SoftConfig::default(), ReplayConfig::default())
}

fn open_with(log: &ChunkLog, soft: SoftConfig, config: ReplayConfig) -> ReplaySession {
    let device: Arc<dyn DriverDevice> = Arc::new(SoftDevice::new(soft));
    ReplaySession::open(device, log.clone(), config).unwrap()
}

struct TwoTargets {
    log: ChunkLog,
    a: ResourceId,
    b: ResourceId,
    draw_a: EventId,
}

/// Draws red into A, then switches to B and fills it with green.
fn capture_two_targets() -> TwoTargets {
    let device = WrappedDevice::new(Arc::new(SoftDevice::default()), CaptureOptions::default());
    let desc = TextureDesc::new_2d(4, 4, Format::R8G8B8A8Unorm);
    let a = device.create_texture(&desc, None).unwrap();
    let b = device.create_texture(&desc, None).unwrap();
    let rtv_a = device
        .create_view(&a, &ViewDesc::new(ViewKind::RenderTarget))
        .unwrap();
    let rtv_b = device
        .create_view(&b, &ViewDesc::new(ViewKind::RenderTarget))
        .unwrap();
    let ctx = device.immediate_context();

    device.begin_capture().unwrap();
    ctx.set_render_targets(&[&rtv_a], None).unwrap();
    ctx.clear_render_target_view(&rtv_a, BLACK).unwrap();
    ctx.draw(&[triangle([[0.0, 0.0], [4.0, 0.0], [0.0, 4.0]], [1.0, 0.0, 0.0, 1.0])])
        .unwrap();
    ctx.set_render_targets(&[&rtv_b], None).unwrap();
    ctx.draw(&[triangle([[0.0, 0.0], [8.0, 0.0], [0.0, 8.0]], [0.0, 1.0, 0.0, 1.0])])
        .unwrap();
    let log = device.end_capture().unwrap();

    let draw_a = log
        .chunks()
        .iter()
        .find(|c| c.chunk_type == ChunkType::Draw)
        .map(|c| c.event_id)
        .unwrap();
    TwoTargets {
        log,
        a: a.id(),
        b: b.id(),
        draw_a,
    }
}

#[test]
fn test_range_at_draw_prepares_clear_and_matches_full_replay() {
    let scene = capture_scene(&[triangle(
        [[0.0, 0.0], [4.0, 0.0], [0.0, 4.0]],
        [1.0, 0.0, 0.0, 1.0],
    )]);
    let draw = scene.draws[0];

    let mut ranged = open(&scene.log);
    let anomalies = ranged.replay_range(draw, draw, ReplayMode::Full).unwrap();
    assert!(anomalies.is_empty(), "{anomalies:?}");
    assert_eq!(
        ranged.resources().prepared_contents(scene.target),
        Some(InitialContents::Clear(ClearValue::Color(BLACK)))
    );

    let mut full = open(&scene.log);
    let frame = full.frame();
    full.replay_range(frame.first, frame.last, ReplayMode::Full)
        .unwrap();

    let ranged_pixels = ranged.read_resource(scene.target).unwrap();
    let full_pixels = full.read_resource(scene.target).unwrap();
    assert_eq!(ranged_pixels, full_pixels);
    assert_eq!(&full_pixels[..], &scene.captured_pixels[..]);
    assert!(matches!(ranged.state(), ReplayState::Done { last, .. } if *last == draw));
}

#[test]
fn test_same_range_twice_is_deterministic() {
    let scene = three_draws();
    let (start, end) = (scene.draws[1], scene.draws[2]);
    let mut session = open(&scene.log);

    session.replay_range(start, end, ReplayMode::Full).unwrap();
    let first = session.read_resource(scene.target).unwrap();
    session.replay_range(start, end, ReplayMode::Full).unwrap();
    let second = session.read_resource(scene.target).unwrap();

    assert_eq!(first, second);
    assert_eq!(&second[..], &scene.captured_pixels[..]);
}

#[test]
fn test_draw_only_without_setup_is_reported() {
    let scene = three_draws();
    let mut session = open(&scene.log);
    let draw = scene.draws[1];
    let anomalies = session
        .replay_range(draw, draw, ReplayMode::DrawOnly)
        .unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].event_id, draw);
    assert_eq!(session.cursor(), Some(draw));
}

#[test]
fn test_counters_cover_every_draw() {
    let scene = three_draws();
    let mut session = open(&scene.log);
    let mut registry = CounterRegistry::new();
    let (min, max) = (scene.draws[0], scene.draws[1]);

    let report = session
        .fetch_counters(&mut registry, &[GpuCounter::EventGpuDuration], min, max)
        .unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.timers_created, 2);
    assert!(report.anomalies.is_empty(), "{:?}", report.anomalies);
    for (result, draw) in report.results.iter().zip(&scene.draws) {
        assert_eq!(result.event_id, *draw);
        assert_eq!(result.counter, GpuCounter::EventGpuDuration);
    }
    assert!(report.results[0].value > 0.0);
    assert!(report.results[1].value > 0.0);
    assert_eq!(report.results[2].value, 0.0);

    // Counter passes replay the whole frame.
    assert_eq!(
        session.read_resource(scene.target).unwrap().to_vec(),
        scene.captured_pixels
    );
}

#[test]
fn test_unknown_counter_is_rejected() {
    let scene = three_draws();
    let mut session = open(&scene.log);
    let mut registry = CounterRegistry::new();
    let err = session
        .fetch_counters(&mut registry, &[GpuCounter::Vendor(3)], 0, u32::MAX)
        .unwrap_err();
    assert!(matches!(err, ReplayError::UnknownCounter(GpuCounter::Vendor(3))));
}

#[test]
fn test_debug_view_reuses_its_temporary() {
    let soft = Arc::new(SoftDevice::default());
    let device = WrappedDevice::new(soft, CaptureOptions::default());
    let texture = device
        .create_texture(
            &TextureDesc::new_2d(2, 2, Format::R8G8B8A8Typeless),
            Some(&[1u8; 16]),
        )
        .unwrap();
    let ctx = device.immediate_context();
    device.begin_capture().unwrap();
    ctx.update_subresource(&texture, 0, &[9u8; 16]).unwrap();
    let log = device.end_capture().unwrap();

    let mut session = open(&log);
    let id = texture.id();

    let first = session.debug_view(id, CompType::UInt, false).unwrap();
    assert!(first.info.has_temporary);
    assert_eq!(first.info.view_formats, vec![Format::R8G8B8A8Uint]);
    let contents = session
        .context()
        .read_subresource(first.texture, 0)
        .unwrap();
    assert_eq!(&contents[..], &[1u8; 16]);

    let frame = session.frame();
    session
        .replay_range(frame.first, frame.last, ReplayMode::Full)
        .unwrap();

    let second = session.debug_view(id, CompType::UInt, false).unwrap();
    assert_eq!(second.texture, first.texture);
    assert_eq!(session.debug_views().temporaries_created(), 1);
    assert_eq!(session.debug_views().len(), 1);
    let contents = session
        .context()
        .read_subresource(second.texture, 0)
        .unwrap();
    assert_eq!(&contents[..], &[9u8; 16]);
}

#[test]
fn test_unresolvable_id_faults_range() {
    let mut w = ChunkWriter::new();
    let immediate = ResourceId::NULL;
    let missing = ResourceId::from_raw(99);
    w.append(immediate, &Call::BeginCapture { frame: 0 });
    let clear = w.append(
        immediate,
        &Call::ClearRenderTargetView {
            view: missing,
            color: BLACK,
        },
    );
    w.append(immediate, &Call::EndCapture);
    let mut session = open(&w.finish());

    let err = session
        .replay_range(clear, clear, ReplayMode::Full)
        .unwrap_err();
    assert_eq!(err.event_id(), Some(clear));
    assert_eq!(err.resource(), Some(missing));
    match session.state() {
        ReplayState::Faulted {
            event_id, resource, ..
        } => {
            assert_eq!(*event_id, clear);
            assert_eq!(*resource, Some(missing));
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(session.cursor(), None);

    // The session still accepts ranges.
    session.reset_state();
    assert!(session.state().is_idle());
}

#[test]
fn test_range_outside_frame_is_invalid() {
    let scene = three_draws();
    let mut session = open(&scene.log);
    let frame = session.frame();
    assert!(matches!(
        session.replay_range(frame.begin, frame.last, ReplayMode::Full),
        Err(ReplayError::InvalidRange { .. })
    ));
    assert!(matches!(
        session.replay_range(frame.first, frame.first, ReplayMode::UpToDrawExclusive),
        Err(ReplayError::InvalidRange { .. })
    ));
    assert!(session.state().is_idle());
}

#[test]
fn test_controller_round_trip() {
    let scene = three_draws();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.gcap");
    scene.log.save(&path).unwrap();

    let (command_tx, command_rx) = gpucap_ipc::command_channel();
    let (event_tx, event_rx) = gpucap_ipc::event_channel();
    let controller = create_controller(
        command_rx,
        event_tx,
        ReplayConfig::default(),
        DriverKind::Soft,
    );
    let handle = controller.spawn().unwrap();
    let recv = || event_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    assert!(matches!(recv(), ReplayEvent::Ready));

    command_tx
        .send(ReplayCommand::OpenCapture { path: path.clone() })
        .unwrap();
    match recv() {
        ReplayEvent::CaptureOpened { chunk_count, .. } => {
            assert_eq!(chunk_count, scene.log.len())
        }
        other => panic!("unexpected {other:?}"),
    }

    command_tx
        .send(ReplayCommand::ReplayRange {
            start: scene.draws[0],
            end: scene.draws[2],
            mode: ReplayMode::Full,
        })
        .unwrap();
    let mut states = Vec::new();
    loop {
        match recv() {
            ReplayEvent::StateChanged { current, .. } => states.push(current.name()),
            ReplayEvent::RangeReplayed { anomalies } => {
                assert!(anomalies.is_empty());
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(states, vec!["Preparing", "Executing", "Done"]);

    command_tx.send(ReplayCommand::GetDrawcalls).unwrap();
    match recv() {
        ReplayEvent::Drawcalls(tree) => assert_eq!(tree.len(), 4),
        other => panic!("unexpected {other:?}"),
    }

    command_tx.send(ReplayCommand::EnumerateCounters).unwrap();
    match recv() {
        ReplayEvent::CounterList(list) => assert_eq!(list, vec![GpuCounter::EventGpuDuration]),
        other => panic!("unexpected {other:?}"),
    }

    command_tx
        .send(ReplayCommand::DescribeCounter(GpuCounter::Vendor(1)))
        .unwrap();
    assert!(matches!(
        recv(),
        ReplayEvent::Error {
            recoverable: true,
            ..
        }
    ));

    command_tx.send(ReplayCommand::Shutdown).unwrap();
    assert!(matches!(recv(), ReplayEvent::Shutdown));
    handle.join().unwrap();
}

#[test]
fn test_repeated_range_restores_targets_written_later() {
    let scene = capture_two_targets();
    let mut session = open(&scene.log);
    let frame = session.frame();
    let draw = scene.draw_a;

    session.replay_range(draw, draw, ReplayMode::Full).unwrap();
    let a_first = session.read_resource(scene.a).unwrap();
    let b_first = session.read_resource(scene.b).unwrap();
    assert_eq!(&b_first[..], &[0u8; 64][..]);

    session
        .replay_range(draw + 1, frame.last, ReplayMode::Full)
        .unwrap();
    let b_later = session.read_resource(scene.b).unwrap();
    assert_eq!(&b_later[..4], &[0, 255, 0, 255]);

    let anomalies = session.replay_range(draw, draw, ReplayMode::Full).unwrap();
    assert!(anomalies.is_empty(), "{anomalies:?}");
    assert_eq!(session.read_resource(scene.a).unwrap(), a_first);
    assert_eq!(session.read_resource(scene.b).unwrap(), b_first);
}

#[test]
fn test_draw_only_after_repeated_setup_continues() {
    let scene = three_draws();
    let (start, draw) = (scene.draws[0], scene.draws[2]);
    let mut session = open(&scene.log);

    for _ in 0..2 {
        let anomalies = session
            .replay_range(start, draw, ReplayMode::UpToDrawExclusive)
            .unwrap();
        assert!(anomalies.is_empty(), "{anomalies:?}");
        assert_eq!(session.cursor(), Some(draw - 1));
    }
    let anomalies = session
        .replay_range(draw, draw, ReplayMode::DrawOnly)
        .unwrap();
    assert!(anomalies.is_empty(), "{anomalies:?}");
    assert_eq!(
        session.read_resource(scene.target).unwrap().to_vec(),
        scene.captured_pixels
    );
}

#[test]
fn test_disjoint_clock_reports_zero_durations() {
    let scene = three_draws();
    let soft = SoftConfig {
        report_disjoint: true,
        ..SoftConfig::default()
    };
    let mut session = open_with(&scene.log, soft, ReplayConfig::default());
    let mut registry = CounterRegistry::new();

    let report = session
        .fetch_counters(
            &mut registry,
            &[GpuCounter::EventGpuDuration],
            scene.draws[0],
            scene.draws[2],
        )
        .unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.timers_created, 3);
    assert!(report.results.iter().all(|r| r.value == 0.0));
    assert!(report
        .anomalies
        .iter()
        .any(|a| a.description.contains("disjoint")));
}

#[test]
fn test_pending_queries_give_up_after_poll_limit() {
    let scene = three_draws();
    // Queries stay pending for two polls; give up after one.
    let config = ReplayConfig {
        query_poll_limit: 1,
        ..ReplayConfig::default()
    };
    let mut session = open_with(&scene.log, SoftConfig::default(), config);
    let mut registry = CounterRegistry::new();

    let report = session
        .fetch_counters(
            &mut registry,
            &[GpuCounter::EventGpuDuration],
            scene.draws[0],
            scene.draws[2],
        )
        .unwrap();

    assert_eq!(report.results.len(), 3);
    assert!(report.results.iter().all(|r| r.value == 0.0));
    assert!(report
        .anomalies
        .iter()
        .any(|a| a.description.contains("never became available")));
}
