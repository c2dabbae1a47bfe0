//! Tagged memory regions.
//!
//! Every buffer the front end owns is requested from a [`MemoryProvider`]
//! with a tag naming the logical region, so an integrator can place each
//! region in fast or bulk memory. Without a registered provider all regions
//! come from the heap.
//!
//! An [`AfeBuffer`] remembers the provider that produced it and hands the
//! storage back to that same provider exactly once, on [`AfeBuffer::release`]
//! or on drop.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AfeError, AfeResult};

/// Logical memory regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemTag {
    Invalid,
    AfeContext,
    AfeOutputBuffer,
    AfeDbgOutBuffer,
    AfeTunerCmdBuffer,
    AlgorithmPersistentMemory,
    AlgorithmScratchMemory,
    AlgorithmBfMemory,
    AlgorithmNsMemory,
    AlgorithmEsMemory,
    GdePersistentMem,
    GenericMemory,
}

pub trait MemoryProvider: Send + Sync {
    /// Returns at least `size` bytes, or `None` when the region is exhausted.
    fn alloc(&self, tag: MemTag, size: usize) -> Option<Box<[u8]>>;
    fn free(&self, tag: MemTag, buffer: Box<[u8]>);
}

/// Default provider: plain zeroed heap allocations.
pub struct HeapProvider;

impl MemoryProvider for HeapProvider {
    fn alloc(&self, _tag: MemTag, size: usize) -> Option<Box<[u8]>> {
        Some(vec![0u8; size].into_boxed_slice())
    }

    fn free(&self, _tag: MemTag, buffer: Box<[u8]>) {
        drop(buffer);
    }
}

pub type AllocCallback = Arc<dyn Fn(MemTag, usize) -> Option<Box<[u8]>> + Send + Sync>;
pub type FreeCallback = Arc<dyn Fn(MemTag, Box<[u8]>) + Send + Sync>;

/// Adapts an application alloc/free callback pair.
struct CallbackProvider {
    alloc: AllocCallback,
    free: FreeCallback,
}

impl MemoryProvider for CallbackProvider {
    fn alloc(&self, tag: MemTag, size: usize) -> Option<Box<[u8]>> {
        (self.alloc)(tag, size)
    }

    fn free(&self, tag: MemTag, buffer: Box<[u8]>) {
        (self.free)(tag, buffer)
    }
}

/// Cheap cloneable front for the active provider.
#[derive(Clone)]
pub struct MemoryManager {
    provider: Arc<dyn MemoryProvider>,
    external: bool,
}

impl MemoryManager {
    pub fn heap() -> Self {
        Self {
            provider: Arc::new(HeapProvider),
            external: false,
        }
    }

    pub fn with_provider(provider: Arc<dyn MemoryProvider>) -> Self {
        Self {
            provider,
            external: true,
        }
    }

    /// Builds the manager from an optional callback pair. Both or neither
    /// must be supplied.
    pub fn from_callbacks(
        alloc: Option<AllocCallback>,
        free: Option<FreeCallback>,
    ) -> AfeResult<Self> {
        match (alloc, free) {
            (Some(alloc), Some(free)) => Ok(Self::with_provider(Arc::new(CallbackProvider {
                alloc,
                free,
            }))),
            (None, None) => Ok(Self::heap()),
            _ => Err(AfeError::BadArg(
                "alloc and free memory callbacks must be supplied together",
            )),
        }
    }

    /// True when regions come from an application provider.
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Allocates a zeroed region of `size` bytes.
    pub fn alloc(&self, tag: MemTag, size: usize) -> AfeResult<AfeBuffer> {
        let mut data = self
            .provider
            .alloc(tag, size)
            .ok_or(AfeError::OutOfMemory { tag, size })?;
        if data.len() < size {
            log::error!(
                "Provider returned {} bytes for {:?}, {} requested",
                data.len(),
                tag,
                size
            );
            self.provider.free(tag, data);
            return Err(AfeError::OutOfMemory { tag, size });
        }
        data.fill(0);
        Ok(AfeBuffer {
            tag,
            len: size,
            data: Some(data),
            provider: self.provider.clone(),
        })
    }

    /// Allocates a region holding `samples` 16-bit samples.
    pub fn alloc_samples(&self, tag: MemTag, samples: usize) -> AfeResult<AfeBuffer> {
        let buffer = self.alloc(tag, samples * std::mem::size_of::<i16>())?;
        // 对齐检查放在分配时，处理线程里就不会再失败
        buffer.samples()?;
        Ok(buffer)
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("external", &self.external)
            .finish()
    }
}

/// A region owned by the front end.
pub struct AfeBuffer {
    tag: MemTag,
    len: usize,
    data: Option<Box<[u8]>>,
    provider: Arc<dyn MemoryProvider>,
}

impl AfeBuffer {
    pub fn tag(&self) -> MemTag {
        self.tag
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            Some(d) => &d[..self.len],
            None => &[],
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            Some(d) => &mut d[..self.len],
            None => &mut [],
        }
    }

    pub fn samples(&self) -> AfeResult<&[i16]> {
        let tag = self.tag;
        bytemuck::try_cast_slice(self.as_bytes()).map_err(|e| {
            AfeError::Generic(format!("{:?} region is not a sample buffer: {}", tag, e))
        })
    }

    pub fn samples_mut(&mut self) -> AfeResult<&mut [i16]> {
        let tag = self.tag;
        bytemuck::try_cast_slice_mut(self.as_bytes_mut()).map_err(|e| {
            AfeError::Generic(format!("{:?} region is not a sample buffer: {}", tag, e))
        })
    }

    /// Returns the storage to its provider now.
    pub fn release(mut self) {
        self.free_inner();
    }

    fn free_inner(&mut self) {
        if let Some(data) = self.data.take() {
            self.provider.free(self.tag, data);
        }
    }
}

impl Drop for AfeBuffer {
    fn drop(&mut self) {
        self.free_inner();
    }
}

impl fmt::Debug for AfeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfeBuffer")
            .field("tag", &self.tag)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Provider that counts outstanding regions per tag.
    #[derive(Default)]
    pub(crate) struct CountingProvider {
        pub live: Mutex<HashMap<MemTag, i32>>,
        pub fail_tag: Option<MemTag>,
    }

    impl CountingProvider {
        pub fn outstanding(&self) -> i32 {
            self.live.lock().values().sum()
        }
    }

    impl MemoryProvider for CountingProvider {
        fn alloc(&self, tag: MemTag, size: usize) -> Option<Box<[u8]>> {
            if self.fail_tag == Some(tag) {
                return None;
            }
            *self.live.lock().entry(tag).or_insert(0) += 1;
            Some(vec![0xAAu8; size].into_boxed_slice())
        }

        fn free(&self, tag: MemTag, _buffer: Box<[u8]>) {
            *self.live.lock().entry(tag).or_insert(0) -= 1;
        }
    }

    #[test]
    fn unpaired_callbacks_are_rejected() {
        let alloc: AllocCallback = Arc::new(|_, size| Some(vec![0u8; size].into_boxed_slice()));
        let free: FreeCallback = Arc::new(|_, _| {});
        assert!(matches!(
            MemoryManager::from_callbacks(Some(alloc), None),
            Err(AfeError::BadArg(_))
        ));
        assert!(matches!(
            MemoryManager::from_callbacks(None, Some(free)),
            Err(AfeError::BadArg(_))
        ));
        let mgr = MemoryManager::from_callbacks(None, None).unwrap();
        assert!(!mgr.is_external());
    }

    #[test]
    fn buffer_returns_to_its_provider_once() {
        let provider = Arc::new(CountingProvider::default());
        let mgr = MemoryManager::with_provider(provider.clone());

        let a = mgr.alloc(MemTag::AfeDbgOutBuffer, 320).unwrap();
        let b = mgr.alloc_samples(MemTag::AfeOutputBuffer, 160).unwrap();
        assert_eq!(provider.outstanding(), 2);
        // provider filled with 0xAA, manager hands out zeroed memory
        assert!(a.as_bytes().iter().all(|&x| x == 0));
        assert_eq!(b.samples().unwrap().len(), 160);

        a.release();
        assert_eq!(provider.outstanding(), 1);
        drop(b);
        assert_eq!(provider.outstanding(), 0);
    }

    #[test]
    fn exhausted_region_reports_out_of_memory() {
        let provider = Arc::new(CountingProvider {
            fail_tag: Some(MemTag::AlgorithmScratchMemory),
            ..Default::default()
        });
        let mgr = MemoryManager::with_provider(provider);
        let err = mgr.alloc(MemTag::AlgorithmScratchMemory, 64).unwrap_err();
        assert_eq!(
            err,
            AfeError::OutOfMemory {
                tag: MemTag::AlgorithmScratchMemory,
                size: 64
            }
        );
    }

    #[test]
    fn short_allocation_is_handed_back() {
        let freed = Arc::new(Mutex::new(0));
        let freed_cb = freed.clone();
        let alloc: AllocCallback = Arc::new(|_, _| Some(vec![0u8; 8].into_boxed_slice()));
        let free: FreeCallback = Arc::new(move |_, _| *freed_cb.lock() += 1);
        let mgr = MemoryManager::from_callbacks(Some(alloc), Some(free)).unwrap();
        assert!(mgr.alloc(MemTag::GenericMemory, 16).is_err());
        assert_eq!(*freed.lock(), 1);
    }
}
