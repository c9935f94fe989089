//! The drawcall tree: actions grouped under marker regions and command-list
//! submissions.

use tracing::warn;

use gpucap_ipc::{ActionKind, DrawcallDescription, EventId};
use gpucap_log::{Call, Chunk, ChunkLog};

use crate::{ReplayError, ReplayResult};

/// Builds the tree for the frame events `[first, last]`.
pub fn build_drawcalls(
    log: &ChunkLog,
    first: EventId,
    last: EventId,
) -> ReplayResult<Vec<DrawcallDescription>> {
    build(log.range(first, last))
}

fn build(chunks: &[Chunk]) -> ReplayResult<Vec<DrawcallDescription>> {
    // Each open marker region keeps its node and the siblings collected
    // before it was pushed.
    let mut open: Vec<(DrawcallDescription, Vec<DrawcallDescription>)> = Vec::new();
    let mut current = Vec::new();
    let mut i = 0;
    while i < chunks.len() {
        let chunk = &chunks[i];
        let call = chunk.call()?;
        match &call {
            Call::PushMarker { name } => {
                let group = DrawcallDescription {
                    event_id: chunk.event_id,
                    name: name.clone(),
                    kind: ActionKind::Group,
                    children: Vec::new(),
                };
                open.push((group, std::mem::take(&mut current)));
            }
            Call::PopMarker => match open.pop() {
                Some((mut group, siblings)) => {
                    group.children = std::mem::replace(&mut current, siblings);
                    current.push(group);
                }
                None => warn!(event_id = chunk.event_id, "Marker pop without push"),
            },
            Call::ExecuteCommandList { child_count, .. } => {
                let end = i + 1 + *child_count as usize;
                let children = chunks.get(i + 1..end).ok_or_else(|| ReplayError::Corrupt {
                    event_id: chunk.event_id,
                    reason: format!("command list claims {child_count} children past end of log"),
                })?;
                current.push(DrawcallDescription {
                    event_id: chunk.event_id,
                    name: action_name(&call),
                    kind: ActionKind::ExecuteCommandList,
                    children: build(children)?,
                });
                i = end;
                continue;
            }
            _ => {
                if let Some(kind) = call.action() {
                    current.push(DrawcallDescription {
                        event_id: chunk.event_id,
                        name: action_name(&call),
                        kind,
                        children: Vec::new(),
                    });
                }
            }
        }
        i += 1;
    }

    // Regions still open at the end of the frame are closed there.
    while let Some((mut group, siblings)) = open.pop() {
        group.children = std::mem::replace(&mut current, siblings);
        current.push(group);
    }
    Ok(current)
}

fn action_name(call: &Call) -> String {
    match call {
        Call::Draw { triangles } => format!("Draw({})", triangles.len()),
        Call::Dispatch { args } => format!(
            "Dispatch({}, {}, {})",
            args.groups[0], args.groups[1], args.groups[2]
        ),
        Call::ClearRenderTargetView { view, .. }
        | Call::ClearDepthStencilView { view, .. }
        | Call::ClearView { view, .. } => format!("{}({view})", call.chunk_type().name()),
        Call::CopyResource { dst, src } => format!("CopyResource({dst}, {src})"),
        Call::UpdateSubresource { dst, subresource, .. } => {
            format!("UpdateSubresource({dst}, {subresource})")
        }
        Call::ResolveSubresource { dst, src, .. } => format!("ResolveSubresource({dst}, {src})"),
        Call::ExecuteCommandList { list, .. } => format!("ExecuteCommandList({list})"),
        Call::SetMarker { name } => name.clone(),
        other => other.chunk_type().name().to_string(),
    }
}

/// Event ids of every timed action, in traversal order.
pub fn timed_events(tree: &[DrawcallDescription]) -> Vec<EventId> {
    fn walk(nodes: &[DrawcallDescription], out: &mut Vec<EventId>) {
        for node in nodes {
            if node.kind.is_timed() {
                out.push(node.event_id);
            }
            walk(&node.children, out);
        }
    }
    let mut out = Vec::new();
    walk(tree, &mut out);
    out
}

/// Finds the node for an event anywhere in the tree.
pub fn find_action(tree: &[DrawcallDescription], event_id: EventId) -> Option<&DrawcallDescription> {
    tree.iter().find_map(|node| {
        if node.event_id == event_id {
            Some(node)
        } else {
            find_action(&node.children, event_id)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucap_ipc::{DispatchArgs, ResourceId, Triangle};
    use gpucap_log::ChunkWriter;

    fn tri() -> Triangle {
        Triangle {
            vertices: [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]],
            depth: 0.0,
            color: [1.0; 4],
        }
    }

    #[test]
    fn test_markers_group_actions() {
        let mut w = ChunkWriter::new();
        let ctx = ResourceId::NULL;
        w.append(ctx, &Call::PushMarker { name: "shadows".into() });
        let draw = w.append(ctx, &Call::Draw { triangles: vec![tri(); 2] });
        w.append(ctx, &Call::PopMarker);
        let dispatch = w.append(
            ctx,
            &Call::Dispatch {
                args: DispatchArgs {
                    groups: [2, 1, 1],
                    threads_per_group: 4,
                    value: 1,
                },
            },
        );
        let log = w.finish();

        let tree = build_drawcalls(&log, 0, dispatch).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].kind, ActionKind::Group);
        assert_eq!(tree[0].name, "shadows");
        assert_eq!(tree[0].children[0].name, "Draw(2)");
        assert_eq!(tree[1].name, "Dispatch(2, 1, 1)");
        assert_eq!(timed_events(&tree), vec![draw, dispatch]);
        assert_eq!(find_action(&tree, draw).unwrap().kind, ActionKind::Draw);
    }

    #[test]
    fn test_command_list_children_nest() {
        let mut w = ChunkWriter::new();
        let deferred = ResourceId::from_raw(9);
        let exec = w.append(
            ResourceId::NULL,
            &Call::ExecuteCommandList {
                list: ResourceId::from_raw(10),
                child_count: 2,
                restore_state: false,
            },
        );
        w.append(
            deferred,
            &Call::SetRenderTargets {
                render_targets: vec![ResourceId::from_raw(3)],
                depth_stencil: ResourceId::NULL,
            },
        );
        let draw = w.append(deferred, &Call::Draw { triangles: vec![tri()] });
        let after = w.append(ResourceId::NULL, &Call::SetMarker { name: "end".into() });
        let log = w.finish();

        let tree = build_drawcalls(&log, exec, after).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].kind, ActionKind::ExecuteCommandList);
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].event_id, draw);
        assert_eq!(tree[1].kind, ActionKind::Marker);
        assert_eq!(timed_events(&tree), vec![draw]);
    }

    #[test]
    fn test_unbalanced_markers() {
        let mut w = ChunkWriter::new();
        w.append(ResourceId::NULL, &Call::PopMarker);
        w.append(ResourceId::NULL, &Call::PushMarker { name: "open".into() });
        let draw = w.append(ResourceId::NULL, &Call::Draw { triangles: vec![] });
        let log = w.finish();

        let tree = build_drawcalls(&log, 0, draw).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].children[0].event_id, draw);
    }

    #[test]
    fn test_truncated_command_list_is_corrupt() {
        let mut w = ChunkWriter::new();
        let exec = w.append(
            ResourceId::NULL,
            &Call::ExecuteCommandList {
                list: ResourceId::from_raw(2),
                child_count: 4,
                restore_state: true,
            },
        );
        let log = w.finish();
        assert!(matches!(
            build_drawcalls(&log, exec, exec),
            Err(ReplayError::Corrupt { .. })
        ));
    }
}
