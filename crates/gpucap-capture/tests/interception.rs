use std::sync::Arc;

use gpucap_capture::{CaptureError, DeviceChild, WrappedDevice};
use gpucap_driver::{DriverDevice, NativeHandle, SoftConfig, SoftDevice};
use gpucap_ipc::{
    BindFlags, BufferDesc, CaptureOptions, Format, InterfaceVersion, MapMode, ResourceId,
    TextureDesc, Triangle, Usage, ViewDesc, ViewKind,
};
use gpucap_log::{Call, ChunkLog, ChunkType};

fn soft_device() -> (Arc<SoftDevice>, WrappedDevice) {
    let soft = Arc::new(SoftDevice::default());
    let device = WrappedDevice::new(soft.clone(), CaptureOptions::default());
    (soft, device)
}

fn frame_calls(log: &ChunkLog) -> Vec<(ResourceId, Call)> {
    let begin = log
        .chunks()
        .iter()
        .position(|c| c.chunk_type == ChunkType::BeginCapture)
        .unwrap();
    log.chunks()[begin + 1..log.len() - 1]
        .iter()
        .map(|c| (c.context, c.call().unwrap()))
        .collect()
}

fn full_triangle(color: [f32; 4]) -> Triangle {
    Triangle {
        vertices: [[-1.0, -1.0], [9.0, -1.0], [-1.0, 9.0]],
        depth: 0.5,
        color,
    }
}

#[test]
fn test_ids_survive_handle_reuse() {
    let (_soft, device) = soft_device();
    let desc = BufferDesc::new(64, BindFlags::NONE);
    let a = device.create_buffer(&desc, None).unwrap();
    let b = device.create_buffer(&desc, None).unwrap();
    let (a_id, b_id) = (a.id(), b.id());
    let a_native = device.resources().resolve(a_id).unwrap();
    drop(a);

    let c = device.create_buffer(&desc, None).unwrap();
    let c_native = device.resources().resolve(c.id()).unwrap();
    // The driver hands the freed slot out again.
    assert_eq!(c_native, a_native);
    assert_ne!(c.id(), a_id);
    assert_eq!(b.id(), b_id);
    assert!(matches!(
        device.resources().resolve(a_id),
        Err(CaptureError::Released(_))
    ));
    assert_ne!(device.resources().resolve(b_id).unwrap(), NativeHandle::from_raw(0));
}

#[test]
fn test_failed_call_records_nothing() {
    let (_soft, device) = soft_device();
    let small = device
        .create_texture(&TextureDesc::new_2d(2, 2, Format::R8G8B8A8Unorm), None)
        .unwrap();
    let large = device
        .create_texture(&TextureDesc::new_2d(4, 4, Format::R8G8B8A8Unorm), None)
        .unwrap();
    let ctx = device.immediate_context();

    device.begin_capture().unwrap();
    assert!(matches!(
        ctx.copy_resource(&small, &large),
        Err(CaptureError::Driver(_))
    ));
    let log = device.end_capture().unwrap();
    assert!(frame_calls(&log).is_empty());
    assert!(!device.resources().has_data(small.id()));
}

#[test]
fn test_unsupported_entry_points() {
    let mut config = SoftConfig::default();
    config.caps.interface_version = InterfaceVersion::V1;
    let device = WrappedDevice::new(Arc::new(SoftDevice::new(config)), CaptureOptions::default());
    assert!(!device.supports(InterfaceVersion::V2));
    let texture = device
        .create_texture(&TextureDesc::new_2d(2, 2, Format::R8G8B8A8Unorm), None)
        .unwrap();
    let view = device
        .create_view(&texture, &ViewDesc::new(ViewKind::RenderTarget))
        .unwrap();
    let ctx = device.immediate_context();

    device.begin_capture().unwrap();
    assert!(matches!(
        ctx.discard_resource(&texture),
        Err(CaptureError::NotSupported(_))
    ));
    assert!(matches!(
        ctx.clear_view(&view, [0.0; 4]),
        Err(CaptureError::NotSupported(_))
    ));
    let log = device.end_capture().unwrap();
    assert!(frame_calls(&log).is_empty());
}

#[test]
fn test_deferred_calls_spliced_at_execute() {
    let (soft, device) = soft_device();
    let target = device
        .create_texture(&TextureDesc::new_2d(4, 4, Format::R8G8B8A8Unorm), None)
        .unwrap();
    let rtv = device
        .create_view(&target, &ViewDesc::new(ViewKind::RenderTarget))
        .unwrap();
    let deferred = device.create_deferred_context().unwrap();
    let immediate = device.immediate_context();

    device.begin_capture().unwrap();
    deferred.set_render_targets(&[&rtv], None).unwrap();
    deferred.clear_render_target_view(&rtv, [0.0, 0.0, 1.0, 1.0]).unwrap();
    deferred.draw(&[full_triangle([1.0, 0.0, 0.0, 1.0])]).unwrap();
    immediate.set_marker("before lists");
    let list = deferred.finish_command_list(false).unwrap();
    assert_eq!(list.call_count(), 3);
    immediate.execute_command_list(&list, true).unwrap();
    let log = device.end_capture().unwrap();

    let calls = frame_calls(&log);
    assert_eq!(calls.len(), 5);
    assert!(matches!(calls[0].1, Call::SetMarker { .. }));
    assert_eq!(calls[0].0, ResourceId::NULL);
    match &calls[1] {
        (ctx, Call::ExecuteCommandList { list: id, child_count, restore_state }) => {
            assert!(ctx.is_null());
            assert_eq!(*id, list.id());
            assert_eq!(*child_count, 3);
            assert!(*restore_state);
        }
        other => panic!("unexpected {other:?}"),
    }
    for (ctx, _) in &calls[2..] {
        assert_eq!(*ctx, deferred.id());
    }
    assert!(matches!(calls[4].1, Call::Draw { .. }));

    let native = device.resources().resolve(target.id()).unwrap();
    let pixels = soft.immediate_context().read_subresource(native, 0).unwrap();
    assert_eq!(&pixels[..4], &[255, 0, 0, 255]);
    assert!(device.resources().has_data(target.id()));
}

#[test]
fn test_restored_list_state_carries_over() {
    let (_soft, device) = soft_device();
    let target = device
        .create_texture(&TextureDesc::new_2d(2, 2, Format::R8G8B8A8Unorm), None)
        .unwrap();
    let rtv = device
        .create_view(&target, &ViewDesc::new(ViewKind::RenderTarget))
        .unwrap();
    let deferred = device.create_deferred_context().unwrap();
    deferred.set_render_targets(&[&rtv], None).unwrap();
    let first = deferred.finish_command_list(true).unwrap();
    assert_eq!(first.call_count(), 1);

    deferred.draw(&[full_triangle([0.0, 1.0, 0.0, 1.0])]).unwrap();
    let second = deferred.finish_command_list(false).unwrap();
    // The second list re-binds the carried targets before its draw.
    assert_eq!(second.call_count(), 2);
    assert!(deferred.bindings().is_empty());
}

#[test]
fn test_write_maps_are_recorded() {
    let (_soft, device) = soft_device();
    let mut desc = BufferDesc::new(8, BindFlags::NONE);
    desc.usage = Usage::Staging;
    let buffer = device.create_buffer(&desc, Some(&[1u8; 8])).unwrap();
    let ctx = device.immediate_context();

    device.begin_capture().unwrap();
    let read = ctx.map(&buffer, 0, MapMode::Read).unwrap();
    assert_eq!(read.data(), &[1u8; 8]);
    ctx.unmap(read).unwrap();

    let mut write = ctx.map(&buffer, 0, MapMode::Write).unwrap();
    assert!(matches!(
        ctx.map(&buffer, 0, MapMode::Read),
        Err(CaptureError::InvalidArgument(_))
    ));
    write.data_mut()[0] = 42;
    ctx.unmap(write).unwrap();
    let log = device.end_capture().unwrap();

    let calls = frame_calls(&log);
    assert_eq!(calls.len(), 1);
    match &calls[0].1 {
        Call::Unmap { id, subresource, data } => {
            assert_eq!(*id, buffer.id());
            assert_eq!(*subresource, 0);
            assert_eq!(data[0], 42);
            assert_eq!(&data[1..], &[1u8; 7]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_default_buffers_cannot_be_mapped() {
    let (_soft, device) = soft_device();
    let buffer = device
        .create_buffer(&BufferDesc::new(8, BindFlags::NONE), None)
        .unwrap();
    let ctx = device.immediate_context();
    assert!(matches!(
        ctx.map(&buffer, 0, MapMode::WriteDiscard),
        Err(CaptureError::InvalidArgument(_))
    ));
    let deferred = device.create_deferred_context().unwrap();
    assert!(deferred.map(&buffer, 0, MapMode::Read).is_err());
}

#[test]
fn test_swap_buffer_is_default_output() {
    let (soft, device) = soft_device();
    let back = device
        .create_swap_buffer(8, 8, Format::B8G8R8A8Unorm)
        .unwrap();
    assert!(device.resources().is_default_output(back.id()));
    device.begin_capture().unwrap();
    let log = device.end_capture().unwrap();
    assert!(log
        .chunks()
        .iter()
        .any(|c| c.chunk_type == ChunkType::CreateSwapBuffer));
    drop(back);
    assert_eq!(soft.stats().live_objects, 0);
}

#[test]
fn test_concurrent_creation_and_deferred_recording() {
    const THREADS: usize = 4;
    let (_soft, device) = soft_device();
    let immediate = device.immediate_context();

    device.begin_capture().unwrap();
    let recorded = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|i| {
                let device = device.clone();
                let immediate = immediate.clone();
                scope.spawn(move || {
                    let target = device
                        .create_texture(&TextureDesc::new_2d(4, 4, Format::R8G8B8A8Unorm), None)
                        .unwrap();
                    let rtv = device
                        .create_view(&target, &ViewDesc::new(ViewKind::RenderTarget))
                        .unwrap();
                    let buffers: Vec<_> = (0..3)
                        .map(|_| {
                            device
                                .create_buffer(&BufferDesc::new(16, BindFlags::NONE), None)
                                .unwrap()
                        })
                        .collect();
                    let deferred = device.create_deferred_context().unwrap();

                    let shade = i as f32 / THREADS as f32;
                    deferred.set_render_targets(&[&rtv], None).unwrap();
                    deferred.clear_render_target_view(&rtv, [shade, 0.0, 0.0, 1.0]).unwrap();
                    deferred.draw(&[full_triangle([0.0, shade, 0.0, 1.0])]).unwrap();
                    let list = deferred.finish_command_list(false).unwrap();
                    immediate.execute_command_list(&list, true).unwrap();

                    let mut ids = vec![target.id(), rtv.id(), deferred.id(), list.id()];
                    ids.extend(buffers.iter().map(|b| b.id()));
                    (ids, deferred.id(), list.id(), list.call_count(), (target, rtv, buffers, deferred, list))
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .collect::<Vec<_>>()
    });
    let log = device.end_capture().unwrap();

    let mut seen = std::collections::HashSet::new();
    for (ids, ..) in &recorded {
        for id in ids {
            assert!(!id.is_null());
            assert!(seen.insert(*id), "{id} handed out twice");
        }
    }
    assert_eq!(seen.len(), THREADS * 7);

    let chunks = log.chunks();
    assert!(chunks.windows(2).all(|w| w[0].event_id < w[1].event_id));

    for (_, context, list, call_count, _) in &recorded {
        let submit = chunks
            .iter()
            .position(|c| {
                matches!(c.call(), Ok(Call::ExecuteCommandList { list: id, .. }) if id == *list)
            })
            .unwrap();
        match chunks[submit].call().unwrap() {
            Call::ExecuteCommandList { child_count, .. } => {
                assert_eq!(child_count as usize, *call_count)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(chunks[submit].context.is_null());
        let children = &chunks[submit + 1..submit + 1 + call_count];
        assert!(children.iter().all(|c| c.context == *context));
        assert!(matches!(children[call_count - 1].call(), Ok(Call::Draw { .. })));
    }
}
