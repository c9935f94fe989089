//! Choosing how a resource's contents are reconstructed at a start event.

use gpucap_ipc::{ClearValue, EventId, ResourceDesc, Usage};

use crate::usage::{Access, AccessKind};

/// Representation chosen for a resource's contents at a start event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitialContentsPlan {
    /// Read the live contents back and store them.
    Copy,
    /// Contents are a single clear value.
    Clear(ClearValue),
    /// Contents are fully overwritten before anything reads them.
    NoneNeeded,
}

/// Decides the cheapest sufficient representation of a resource's contents
/// at the start of a replayed range.
pub trait InitialContentsPolicy: Send + Sync {
    /// `accesses` is the resource's whole history in event order.
    fn plan(&self, desc: &ResourceDesc, accesses: &[Access], start: EventId)
        -> InitialContentsPlan;

    /// Plan for a resource alive when a capture begins. `has_data` is false
    /// when nothing has written it since creation.
    fn plan_at_capture(&self, desc: &ResourceDesc, has_data: bool) -> InitialContentsPlan {
        match desc {
            ResourceDesc::Texture(_) | ResourceDesc::Buffer(_) => {}
            _ => return InitialContentsPlan::NoneNeeded,
        }
        if desc.usage() == Usage::Immutable {
            InitialContentsPlan::NoneNeeded
        } else if has_data {
            InitialContentsPlan::Copy
        } else {
            InitialContentsPlan::Clear(ClearValue::Zeroed)
        }
    }
}

/// The stock policy.
///
/// A resource whose first access in range overwrites it needs only that
/// clear value, or nothing at all. Otherwise its contents survive into the
/// range: when the last thing that set them was a whole-resource clear the
/// clear value is enough, anything else needs a copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl InitialContentsPolicy for DefaultPolicy {
    fn plan(
        &self,
        desc: &ResourceDesc,
        accesses: &[Access],
        start: EventId,
    ) -> InitialContentsPlan {
        match desc {
            ResourceDesc::Texture(_) | ResourceDesc::Buffer(_) => {}
            _ => return InitialContentsPlan::NoneNeeded,
        }
        if desc.usage() == Usage::Immutable {
            return InitialContentsPlan::NoneNeeded;
        }

        let split = accesses.partition_point(|a| a.event_id < start);
        let (before, after) = accesses.split_at(split);
        match after.first().map(|a| a.kind) {
            Some(AccessKind::Clear(value)) => return InitialContentsPlan::Clear(value),
            Some(AccessKind::Write { full: true }) => return InitialContentsPlan::NoneNeeded,
            _ => {}
        }

        let last_write = before
            .iter()
            .rev()
            .map(|a| a.kind)
            .find(|kind| !matches!(kind, AccessKind::Read));
        match last_write {
            Some(AccessKind::Clear(value)) => InitialContentsPlan::Clear(value),
            _ => InitialContentsPlan::Copy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucap_ipc::{BindFlags, BufferDesc, Format, QueryKind, TextureDesc};

    fn access(event_id: EventId, kind: AccessKind) -> Access {
        Access { event_id, kind }
    }

    fn target() -> ResourceDesc {
        ResourceDesc::Texture(
            TextureDesc::new_2d(8, 8, Format::R8G8B8A8Unorm)
                .with_bind_flags(BindFlags::RENDER_TARGET),
        )
    }

    const BLACK: ClearValue = ClearValue::Color([0.0, 0.0, 0.0, 1.0]);

    #[test]
    fn test_clear_before_partial_write() {
        let history = [
            access(1, AccessKind::Clear(ClearValue::Zeroed)),
            access(5, AccessKind::Clear(BLACK)),
            access(6, AccessKind::Write { full: false }),
        ];
        assert_eq!(
            DefaultPolicy.plan(&target(), &history, 6),
            InitialContentsPlan::Clear(BLACK)
        );
        assert_eq!(
            DefaultPolicy.plan(&target(), &history, 5),
            InitialContentsPlan::Clear(BLACK)
        );
    }

    #[test]
    fn test_partial_write_needs_copy() {
        let history = [
            access(1, AccessKind::Clear(BLACK)),
            access(2, AccessKind::Write { full: false }),
            access(3, AccessKind::Read),
            access(4, AccessKind::Write { full: false }),
        ];
        assert_eq!(
            DefaultPolicy.plan(&target(), &history, 3),
            InitialContentsPlan::Copy
        );
    }

    #[test]
    fn test_overwritten_needs_nothing() {
        let history = [
            access(1, AccessKind::Write { full: false }),
            access(4, AccessKind::Write { full: true }),
            access(5, AccessKind::Read),
        ];
        assert_eq!(
            DefaultPolicy.plan(&target(), &history, 2),
            InitialContentsPlan::NoneNeeded
        );
    }

    #[test]
    fn test_untouched_after_start_keeps_last_clear() {
        let history = [access(1, AccessKind::Clear(ClearValue::Zeroed))];
        assert_eq!(
            DefaultPolicy.plan(&target(), &history, 9),
            InitialContentsPlan::Clear(ClearValue::Zeroed)
        );
    }

    #[test]
    fn test_non_content_objects() {
        let query = ResourceDesc::Query(QueryKind::Occlusion);
        assert_eq!(DefaultPolicy.plan(&query, &[], 0), InitialContentsPlan::NoneNeeded);
        let mut buffer = BufferDesc::new(16, BindFlags::NONE);
        buffer.usage = Usage::Immutable;
        let buffer = ResourceDesc::Buffer(buffer);
        assert_eq!(DefaultPolicy.plan(&buffer, &[], 0), InitialContentsPlan::NoneNeeded);
        assert_eq!(
            DefaultPolicy.plan_at_capture(&buffer, true),
            InitialContentsPlan::NoneNeeded
        );
    }

    #[test]
    fn test_capture_time_plan() {
        assert_eq!(
            DefaultPolicy.plan_at_capture(&target(), false),
            InitialContentsPlan::Clear(ClearValue::Zeroed)
        );
        assert_eq!(
            DefaultPolicy.plan_at_capture(&target(), true),
            InitialContentsPlan::Copy
        );
    }
}
