//! The id table and the initial-contents store.
//!
//! [`ResourceManager`] is the only owner of the `ResourceId -> NativeHandle`
//! mapping. Ids are handed out once and never reused; released ids stay in
//! the table as dead records so that a stale id is reported as released
//! rather than resolving to whatever object the driver put in its handle
//! slot since.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use gpucap_driver::{DriverContext, DriverDevice, DriverResult, NativeHandle};
use gpucap_ipc::{EventId, InitialContents, ResourceDesc, ResourceId};

use crate::contents::{clear_contents, write_contents};
use crate::initial::{DefaultPolicy, InitialContentsPlan, InitialContentsPolicy};
use crate::usage::UsageIndex;
use crate::{CaptureError, CaptureResult};

/// What the manager knows about one id.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub desc: ResourceDesc,
    pub name: Option<String>,
    /// Live native object, `None` for objects without one (contexts, lists).
    pub native: Option<NativeHandle>,
    pub alive: bool,
    /// Presentable back buffer.
    pub default_output: bool,
    /// Something has written the contents since creation.
    pub has_data: bool,
}

#[derive(Default)]
struct Prepared {
    start: Option<EventId>,
    contents: HashMap<ResourceId, InitialContents>,
}

#[derive(Default)]
struct Tables {
    records: HashMap<ResourceId, ResourceRecord>,
    /// Contents recorded in the log for resources alive at capture start.
    capture_initial: HashMap<ResourceId, InitialContents>,
    /// Contents derived for the current range start.
    prepared: Prepared,
    /// Ids whose contents were applied in the current range.
    applied: HashSet<ResourceId>,
}

/// Owns the id table and every initial-contents payload.
pub struct ResourceManager {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
    policy: Box<dyn InitialContentsPolicy>,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::with_policy(Box::new(DefaultPolicy))
    }

    pub fn with_policy(policy: Box<dyn InitialContentsPolicy>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_id: AtomicU64::new(1),
            policy,
        }
    }

    pub fn policy(&self) -> &dyn InitialContentsPolicy {
        &*self.policy
    }

    /// Runs `create` and registers its object under a fresh id. When
    /// creation fails no id is consumed.
    pub fn create_resource(
        &self,
        desc: ResourceDesc,
        create: impl FnOnce() -> DriverResult<Option<NativeHandle>>,
    ) -> CaptureResult<ResourceId> {
        let native = create()?;
        let id = ResourceId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.insert(id, desc, native);
        debug!(%id, kind = desc.kind().name(), ?native, "Registered resource");
        Ok(id)
    }

    /// Registers an object under an id chosen elsewhere, as replay does with
    /// ids read from a log.
    pub fn register(
        &self,
        id: ResourceId,
        desc: ResourceDesc,
        native: Option<NativeHandle>,
    ) -> CaptureResult<()> {
        if id.is_null() {
            return Err(CaptureError::InvalidArgument("null resource id".into()));
        }
        if self.tables.read().records.contains_key(&id) {
            return Err(CaptureError::Duplicate(id));
        }
        self.next_id.fetch_max(id.as_raw() + 1, Ordering::SeqCst);
        self.insert(id, desc, native);
        trace!(%id, kind = desc.kind().name(), "Registered resource from log");
        Ok(())
    }

    fn insert(&self, id: ResourceId, desc: ResourceDesc, native: Option<NativeHandle>) {
        self.tables.write().records.insert(
            id,
            ResourceRecord {
                id,
                desc,
                name: None,
                native,
                alive: true,
                default_output: false,
                has_data: false,
            },
        );
    }

    /// Marks an id dead and hands back its native handle for release. The id
    /// is never handed out again.
    pub fn release_resource(&self, id: ResourceId) -> CaptureResult<Option<NativeHandle>> {
        let mut tables = self.tables.write();
        let record = tables
            .records
            .get_mut(&id)
            .ok_or(CaptureError::UnknownResource(id))?;
        if !record.alive {
            return Err(CaptureError::Released(id));
        }
        record.alive = false;
        let native = record.native.take();
        tables.capture_initial.remove(&id);
        tables.prepared.contents.remove(&id);
        debug!(%id, "Released resource");
        Ok(native)
    }

    /// Live native handle of an id.
    pub fn resolve(&self, id: ResourceId) -> CaptureResult<NativeHandle> {
        let tables = self.tables.read();
        let record = tables
            .records
            .get(&id)
            .ok_or(CaptureError::UnknownResource(id))?;
        if !record.alive {
            return Err(CaptureError::Released(id));
        }
        record.native.ok_or(CaptureError::WrongKind {
            id,
            expected: "native object",
        })
    }

    /// Description of a live id.
    pub fn desc(&self, id: ResourceId) -> CaptureResult<ResourceDesc> {
        let tables = self.tables.read();
        match tables.records.get(&id) {
            Some(record) if record.alive => Ok(record.desc),
            Some(_) => Err(CaptureError::Released(id)),
            None => Err(CaptureError::UnknownResource(id)),
        }
    }

    /// Resource behind a view, or the id itself for anything else.
    pub fn underlying(&self, id: ResourceId) -> CaptureResult<ResourceId> {
        match self.desc(id)? {
            ResourceDesc::View { resource, .. } => Ok(resource),
            _ => Ok(id),
        }
    }

    /// Snapshot of one record, dead or alive.
    pub fn record(&self, id: ResourceId) -> Option<ResourceRecord> {
        self.tables.read().records.get(&id).cloned()
    }

    /// Live ids in creation order.
    pub fn live_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self
            .tables
            .read()
            .records
            .values()
            .filter(|r| r.alive)
            .map(|r| r.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn live_count(&self) -> usize {
        self.tables.read().records.values().filter(|r| r.alive).count()
    }

    pub fn set_name(&self, id: ResourceId, name: &str) -> CaptureResult<()> {
        let mut tables = self.tables.write();
        let record = tables
            .records
            .get_mut(&id)
            .ok_or(CaptureError::UnknownResource(id))?;
        record.name = Some(name.to_string());
        Ok(())
    }

    pub fn name(&self, id: ResourceId) -> Option<String> {
        self.tables.read().records.get(&id)?.name.clone()
    }

    pub fn set_default_output(&self, id: ResourceId) {
        if let Some(record) = self.tables.write().records.get_mut(&id) {
            record.default_output = true;
        }
    }

    pub fn is_default_output(&self, id: ResourceId) -> bool {
        self.tables
            .read()
            .records
            .get(&id)
            .is_some_and(|r| r.default_output)
    }

    /// Flags the contents of `id` as written.
    pub fn mark_written(&self, id: ResourceId) {
        if let Some(record) = self.tables.write().records.get_mut(&id) {
            record.has_data = true;
        }
    }

    pub fn has_data(&self, id: ResourceId) -> bool {
        self.tables.read().records.get(&id).is_some_and(|r| r.has_data)
    }

    /// Stores contents recorded at capture start.
    pub fn set_capture_initial_contents(&self, id: ResourceId, contents: InitialContents) {
        self.tables.write().capture_initial.insert(id, contents);
    }

    pub fn capture_initial_contents(&self, id: ResourceId) -> Option<InitialContents> {
        self.tables.read().capture_initial.get(&id).cloned()
    }

    /// Ids with contents recorded at capture start, in id order.
    pub fn capture_initial_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.tables.read().capture_initial.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Starts a new replayed range. Contents prepared for another start
    /// event are dropped, and every id needs its contents applied again.
    pub fn begin_range(&self, start: EventId) {
        let mut tables = self.tables.write();
        if tables.prepared.start != Some(start) {
            if tables.prepared.start.is_some() {
                debug!(
                    old = ?tables.prepared.start,
                    new = start,
                    "Range start moved, dropping prepared contents"
                );
            }
            tables.prepared = Prepared {
                start: Some(start),
                contents: HashMap::new(),
            };
        }
        tables.applied.clear();
    }

    /// Start event of the prepared contents.
    pub fn prepared_start(&self) -> Option<EventId> {
        self.tables.read().prepared.start
    }

    /// Returns true when contents for `id` are already prepared for `start`.
    pub fn is_prepared(&self, id: ResourceId, start: EventId) -> bool {
        let tables = self.tables.read();
        tables.prepared.start == Some(start) && tables.prepared.contents.contains_key(&id)
    }

    /// Decides and stores the contents `id` must hold at `start`. A copy is
    /// taken through `snapshot`, which must read the resource as it is at
    /// `start`. Prepared contents are reused until the start event changes.
    pub fn prepare_initial_contents(
        &self,
        id: ResourceId,
        start: EventId,
        usage: &UsageIndex,
        snapshot: impl FnOnce(NativeHandle, &ResourceDesc) -> DriverResult<Bytes>,
    ) -> CaptureResult<InitialContents> {
        {
            let tables = self.tables.read();
            if tables.prepared.start == Some(start) {
                if let Some(contents) = tables.prepared.contents.get(&id) {
                    return Ok(contents.clone());
                }
            }
        }

        let desc = self.desc(id)?;
        let plan = self.policy.plan(&desc, usage.accesses(id), start);
        let contents = match plan {
            InitialContentsPlan::Copy => {
                let native = self.resolve(id)?;
                InitialContents::Copy(snapshot(native, &desc)?)
            }
            InitialContentsPlan::Clear(value) => InitialContents::Clear(value),
            InitialContentsPlan::NoneNeeded => InitialContents::NoneNeeded,
        };
        debug!(%id, start, contents = contents.name(), "Prepared initial contents");

        let mut tables = self.tables.write();
        if tables.prepared.start != Some(start) {
            tables.prepared = Prepared {
                start: Some(start),
                contents: HashMap::new(),
            };
        }
        tables.prepared.contents.insert(id, contents.clone());
        Ok(contents)
    }

    /// Contents prepared for `id` at the current start event.
    pub fn prepared_contents(&self, id: ResourceId) -> Option<InitialContents> {
        self.tables.read().prepared.contents.get(&id).cloned()
    }

    /// Returns true until contents for `id` have been applied in this range.
    pub fn needs_initial_contents(&self, id: ResourceId) -> bool {
        !self.tables.read().applied.contains(&id)
    }

    /// Writes `contents` into the live resource. Applying the same contents
    /// again leaves the resource unchanged.
    pub fn apply_initial_contents(
        &self,
        id: ResourceId,
        contents: &InitialContents,
        device: &dyn DriverDevice,
        context: &dyn DriverContext,
    ) -> CaptureResult<()> {
        let desc = self.desc(id)?;
        match contents {
            InitialContents::NoneNeeded => {}
            InitialContents::Copy(data) => {
                let native = self.resolve(id)?;
                write_contents(context, native, &desc, data)?;
            }
            InitialContents::Clear(value) => {
                let native = self.resolve(id)?;
                clear_contents(device, context, native, &desc, *value)?;
            }
        }
        trace!(%id, contents = contents.name(), "Applied initial contents");
        self.tables.write().applied.insert(id);
        Ok(())
    }

    /// Applies the contents recorded at capture start to every resource
    /// that has them. Failures are logged and returned per id.
    pub fn apply_capture_initial_contents(
        &self,
        device: &dyn DriverDevice,
        context: &dyn DriverContext,
    ) -> Vec<(ResourceId, CaptureError)> {
        let mut failures = Vec::new();
        for id in self.capture_initial_ids() {
            let Some(contents) = self.capture_initial_contents(id) else {
                continue;
            };
            if let Err(e) = self.apply_initial_contents(id, &contents, device, context) {
                warn!(%id, error = %e, "Failed to restore capture-start contents");
                failures.push((id, e));
            }
        }
        self.tables.write().applied.clear();
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucap_driver::{DriverError, SoftDevice};
    use gpucap_ipc::{BindFlags, BufferDesc, ClearValue, Format, TextureDesc};
    use gpucap_log::{Call, ChunkWriter};

    fn buffer_desc() -> ResourceDesc {
        ResourceDesc::Buffer(BufferDesc::new(16, BindFlags::NONE))
    }

    #[test]
    fn test_failed_creation_consumes_no_id() {
        let rm = ResourceManager::new();
        let a = rm.create_resource(buffer_desc(), || Ok(Some(NativeHandle::from_raw(1))));
        let failed = rm.create_resource(buffer_desc(), || {
            Err(DriverError::InvalidArgument("nope".into()))
        });
        let b = rm.create_resource(buffer_desc(), || Ok(Some(NativeHandle::from_raw(2))));
        assert!(failed.is_err());
        assert_eq!(b.unwrap().as_raw(), a.unwrap().as_raw() + 1);
    }

    #[test]
    fn test_release_keeps_id_dead() {
        let rm = ResourceManager::new();
        let handle = NativeHandle::from_raw(7);
        let a = rm.create_resource(buffer_desc(), || Ok(Some(handle))).unwrap();
        assert_eq!(rm.release_resource(a).unwrap(), Some(handle));

        // Driver reuses the handle for a new object.
        let b = rm.create_resource(buffer_desc(), || Ok(Some(handle))).unwrap();
        assert_ne!(a, b);
        assert!(matches!(rm.resolve(a), Err(CaptureError::Released(id)) if id == a));
        assert_eq!(rm.resolve(b).unwrap(), handle);
        assert!(matches!(
            rm.release_resource(a),
            Err(CaptureError::Released(_))
        ));
        assert!(matches!(
            rm.resolve(ResourceId::from_raw(99)),
            Err(CaptureError::UnknownResource(_))
        ));
        assert_eq!(rm.live_ids(), vec![b]);
    }

    #[test]
    fn test_register_from_log() {
        let rm = ResourceManager::new();
        let id = ResourceId::from_raw(40);
        rm.register(id, buffer_desc(), Some(NativeHandle::from_raw(3)))
            .unwrap();
        assert!(matches!(
            rm.register(id, buffer_desc(), None),
            Err(CaptureError::Duplicate(_))
        ));
        let next = rm.create_resource(buffer_desc(), || Ok(None)).unwrap();
        assert_eq!(next.as_raw(), 41);
    }

    #[test]
    fn test_prepare_is_cached_per_start() {
        let device = SoftDevice::default();
        let ctx = device.immediate_context();
        let desc = TextureDesc::new_2d(2, 2, Format::R8G8B8A8Unorm)
            .with_bind_flags(BindFlags::RENDER_TARGET);
        let rm = ResourceManager::new();
        let id = rm
            .create_resource(ResourceDesc::Texture(desc), || {
                device.create_texture(&desc, Some(&[9u8; 16])).map(Some)
            })
            .unwrap();

        let mut w = ChunkWriter::new();
        w.append(ResourceId::NULL, &Call::CreateTexture {
            id,
            desc,
            initial_data: Some(Bytes::from_static(&[9u8; 16])),
        });
        w.append(ResourceId::NULL, &Call::UpdateSubresource {
            dst: id,
            subresource: 0,
            data: Bytes::from_static(&[1u8; 16]),
        });
        let usage = UsageIndex::build(&w.finish()).unwrap();

        let mut snapshots = 0;
        rm.begin_range(2);
        let first = rm
            .prepare_initial_contents(id, 2, &usage, |native, desc| {
                snapshots += 1;
                crate::contents::read_contents(&*ctx, native, desc)
            })
            .unwrap();
        assert_eq!(first, InitialContents::Copy(Bytes::from_static(&[9u8; 16])));
        let again = rm
            .prepare_initial_contents(id, 2, &usage, |_, _| unreachable!())
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(snapshots, 1);

        rm.begin_range(1);
        assert!(!rm.is_prepared(id, 2));
        assert_eq!(rm.prepared_start(), Some(1));
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let device = SoftDevice::default();
        let ctx = device.immediate_context();
        let desc = TextureDesc::new_2d(2, 2, Format::R8G8B8A8Unorm)
            .with_bind_flags(BindFlags::RENDER_TARGET);
        let rm = ResourceManager::new();
        let id = rm
            .create_resource(ResourceDesc::Texture(desc), || {
                device.create_texture(&desc, None).map(Some)
            })
            .unwrap();
        let native = rm.resolve(id).unwrap();

        for contents in [
            InitialContents::Clear(ClearValue::Color([0.0, 1.0, 0.0, 1.0])),
            InitialContents::Copy(Bytes::from((0u8..16).collect::<Vec<_>>())),
            InitialContents::Clear(ClearValue::Zeroed),
        ] {
            rm.begin_range(0);
            assert!(rm.needs_initial_contents(id));
            rm.apply_initial_contents(id, &contents, &device, &*ctx).unwrap();
            assert!(!rm.needs_initial_contents(id));
            let once = ctx.read_subresource(native, 0).unwrap();
            rm.apply_initial_contents(id, &contents, &device, &*ctx).unwrap();
            let twice = ctx.read_subresource(native, 0).unwrap();
            assert_eq!(once, twice);
        }
    }
}
