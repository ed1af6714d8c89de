//! Process-wide DMA memory domain registry.
//!
//! A memory domain describes where I/O buffers live and how to move or
//! translate data across domains. Domains are created and destroyed
//! explicitly and enumerated in insertion order under the registry mutex.
//! The registry lock is never taken while a controller lock is held.

use std::io::{IoSlice, IoSliceMut};
use std::mem::size_of;
use std::sync::Arc;

use nix::errno::Errno;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Device types a memory domain can describe.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum DmaDeviceType {
    Rdma,
    Dma,
    VfioUser,
    Generic,
}

/// Versioned context attached to a domain at creation. `size` must describe
/// how much of the struct the caller filled in; the copy is clamped to the
/// smaller of the caller's size and ours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryDomainCtx {
    pub size: usize,
    /// Opaque provider handle (an `ibv_pd` for RDMA domains).
    pub user_ctx: u64,
}

/// Result of an address translation between two domains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslationResult {
    pub addr: u64,
    pub len: usize,
}

pub type PullFn = dyn Fn(&MemoryDomain, u64, &[IoSlice<'_>], &mut [IoSliceMut<'_>]) -> Result<(), Errno>
    + Send
    + Sync;
pub type PushFn = dyn Fn(&MemoryDomain, u64, &mut [IoSliceMut<'_>], &[IoSlice<'_>]) -> Result<(), Errno>
    + Send
    + Sync;
pub type TranslateFn = dyn Fn(&MemoryDomain, u64, &MemoryDomain, u64, usize) -> Result<TranslationResult, Errno>
    + Send
    + Sync;

#[derive(Default)]
struct DomainOps {
    pull: Option<Box<PullFn>>,
    push: Option<Box<PushFn>>,
    translate: Option<Box<TranslateFn>>,
}

/// A registered memory domain. Type and id are immutable; the data-movement
/// callbacks are installed after creation.
pub struct MemoryDomain {
    device_type: DmaDeviceType,
    id: Option<String>,
    ctx: Option<MemoryDomainCtx>,
    ops: Mutex<DomainOps>,
}

impl std::fmt::Debug for MemoryDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDomain")
            .field("device_type", &self.device_type)
            .field("id", &self.id)
            .finish()
    }
}

static MEMORY_DOMAINS: Lazy<Mutex<Vec<Arc<MemoryDomain>>>> = Lazy::new(|| Mutex::new(Vec::new()));

impl MemoryDomain {
    /// Creates a domain and appends it to the process-wide registry.
    pub fn create(
        device_type: DmaDeviceType,
        ctx: Option<&MemoryDomainCtx>,
        id: Option<&str>,
    ) -> Result<Arc<MemoryDomain>, Errno> {
        if let Some(ctx) = ctx {
            if ctx.size == 0 {
                error!("Context size can't be 0");
                return Err(Errno::EINVAL);
            }
        }

        let ctx = ctx.map(|c| {
            let mut copy = *c;
            copy.size = size_of::<MemoryDomainCtx>().min(c.size);
            copy
        });

        let domain = Arc::new(MemoryDomain {
            device_type,
            id: id.map(String::from),
            ctx,
            ops: Mutex::new(DomainOps::default()),
        });

        MEMORY_DOMAINS.lock().push(domain.clone());

        Ok(domain)
    }

    /// Removes the domain from the registry. The object stays valid for
    /// holders of other references but is no longer enumerable.
    pub fn destroy(domain: &Arc<MemoryDomain>) {
        let mut domains = MEMORY_DOMAINS.lock();
        domains.retain(|d| !Arc::ptr_eq(d, domain));
    }

    pub fn device_type(&self) -> DmaDeviceType {
        self.device_type
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn context(&self) -> Option<&MemoryDomainCtx> {
        self.ctx.as_ref()
    }

    pub fn set_pull(&self, pull: Option<Box<PullFn>>) {
        self.ops.lock().pull = pull;
    }

    pub fn set_push(&self, push: Option<Box<PushFn>>) {
        self.ops.lock().push = push;
    }

    pub fn set_translation(&self, translate: Option<Box<TranslateFn>>) {
        self.ops.lock().translate = translate;
    }

    /// Pulls data out of this domain into local buffers.
    pub fn pull_data(
        &self,
        src_domain_ctx: u64,
        src: &[IoSlice<'_>],
        dst: &mut [IoSliceMut<'_>],
    ) -> Result<(), Errno> {
        let ops = self.ops.lock();
        match &ops.pull {
            Some(pull) => pull(self, src_domain_ctx, src, dst),
            None => Err(Errno::ENOTSUP),
        }
    }

    /// Pushes local data into this domain.
    pub fn push_data(
        &self,
        dst_domain_ctx: u64,
        dst: &mut [IoSliceMut<'_>],
        src: &[IoSlice<'_>],
    ) -> Result<(), Errno> {
        let ops = self.ops.lock();
        match &ops.push {
            Some(push) => push(self, dst_domain_ctx, dst, src),
            None => Err(Errno::ENOTSUP),
        }
    }

    /// Translates an address in this domain into the destination domain.
    pub fn translate_data(
        &self,
        src_domain_ctx: u64,
        dst_domain: &MemoryDomain,
        addr: u64,
        len: usize,
    ) -> Result<TranslationResult, Errno> {
        let ops = self.ops.lock();
        match &ops.translate {
            Some(translate) => translate(self, src_domain_ctx, dst_domain, addr, len),
            None => Err(Errno::ENOTSUP),
        }
    }

    /// First registered domain, optionally restricted to a matching id.
    pub fn get_first(id: Option<&str>) -> Option<Arc<MemoryDomain>> {
        let domains = MEMORY_DOMAINS.lock();
        match id {
            None => domains.first().cloned(),
            Some(id) => domains.iter().find(|d| d.id() == Some(id)).cloned(),
        }
    }

    /// Domain following `prev` in insertion order, optionally restricted to a
    /// matching id. Returns None when `prev` is no longer registered.
    pub fn get_next(prev: &Arc<MemoryDomain>, id: Option<&str>) -> Option<Arc<MemoryDomain>> {
        let domains = MEMORY_DOMAINS.lock();
        let pos = domains.iter().position(|d| Arc::ptr_eq(d, prev))?;
        domains[pos + 1..]
            .iter()
            .find(|d| id.map_or(true, |id| d.id() == Some(id)))
            .cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // The registry is process-global; serialize tests touching it.
    static TEST_LOCK: Mutex<()> = parking_lot::const_mutex(());

    fn clear_registry() {
        MEMORY_DOMAINS.lock().clear();
    }

    #[test]
    fn create_enumerate_destroy() {
        let _guard = TEST_LOCK.lock();
        clear_registry();

        let a = MemoryDomain::create(DmaDeviceType::Dma, None, Some("a")).unwrap();
        let b = MemoryDomain::create(DmaDeviceType::Rdma, None, Some("b")).unwrap();
        let c = MemoryDomain::create(DmaDeviceType::Generic, None, Some("a")).unwrap();

        // Unfiltered enumeration visits every domain once, insertion order.
        let mut seen = Vec::new();
        let mut cur = MemoryDomain::get_first(None);
        while let Some(d) = cur {
            seen.push(d.id().unwrap().to_string());
            cur = MemoryDomain::get_next(&d, None);
        }
        assert_eq!(seen, ["a", "b", "a"]);

        // Filtered enumeration only yields matching ids.
        let first = MemoryDomain::get_first(Some("a")).unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        let next = MemoryDomain::get_next(&first, Some("a")).unwrap();
        assert!(Arc::ptr_eq(&next, &c));
        assert!(MemoryDomain::get_next(&next, Some("a")).is_none());

        MemoryDomain::destroy(&b);
        let first = MemoryDomain::get_first(None).unwrap();
        let next = MemoryDomain::get_next(&first, None).unwrap();
        assert!(Arc::ptr_eq(&next, &c));

        MemoryDomain::destroy(&a);
        MemoryDomain::destroy(&c);
        assert!(MemoryDomain::get_first(None).is_none());
    }

    #[test]
    fn context_is_clamped() {
        let _guard = TEST_LOCK.lock();
        clear_registry();

        let ctx = MemoryDomainCtx {
            size: 4096,
            user_ctx: 0xdead_beef,
        };
        let domain = MemoryDomain::create(DmaDeviceType::Rdma, Some(&ctx), Some("pd")).unwrap();

        let stored = domain.context().unwrap();
        assert_eq!(stored.size, size_of::<MemoryDomainCtx>());
        assert_eq!(stored.user_ctx, 0xdead_beef);

        // Zero-sized context is rejected.
        let bad = MemoryDomainCtx {
            size: 0,
            user_ctx: 0,
        };
        assert_eq!(
            MemoryDomain::create(DmaDeviceType::Rdma, Some(&bad), None).unwrap_err(),
            Errno::EINVAL
        );

        MemoryDomain::destroy(&domain);
    }

    #[test]
    fn data_ops_require_callbacks() {
        let _guard = TEST_LOCK.lock();
        clear_registry();

        let domain = MemoryDomain::create(DmaDeviceType::Dma, None, None).unwrap();

        let src_data = [1u8, 2, 3, 4];
        let mut dst_data = [0u8; 4];

        let src = [IoSlice::new(&src_data)];
        let mut dst = [IoSliceMut::new(&mut dst_data)];
        assert_eq!(domain.pull_data(0, &src, &mut dst), Err(Errno::ENOTSUP));

        domain.set_pull(Some(Box::new(|_, _, src, dst| {
            let mut out = Vec::new();
            for iov in src {
                out.extend_from_slice(iov);
            }
            let mut off = 0;
            for iov in dst.iter_mut() {
                let n = iov.len().min(out.len() - off);
                iov[..n].copy_from_slice(&out[off..off + n]);
                off += n;
            }
            Ok(())
        })));

        let src = [IoSlice::new(&src_data)];
        let mut dst = [IoSliceMut::new(&mut dst_data)];
        domain.pull_data(0, &src, &mut dst).unwrap();
        drop(dst);
        assert_eq!(dst_data, src_data);

        // Translation is still not installed.
        let other = MemoryDomain::create(DmaDeviceType::Generic, None, None).unwrap();
        assert_eq!(
            domain.translate_data(0, &other, 0x1000, 512).unwrap_err(),
            Errno::ENOTSUP
        );

        MemoryDomain::destroy(&domain);
        MemoryDomain::destroy(&other);
    }
}
